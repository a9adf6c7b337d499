//! 計算バックエンドの選択
//!
//! 学習・推論は任意の burn バックエンドに対してジェネリックに書かれており、
//! ここで設定値から実際のバックエンドとデバイスを決めます。

use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use tracing::info;

use crate::model::DeviceType;

/// CPU (NdArray) バックエンド
pub type CpuBackend = NdArray<f32>;
/// 学習用 CPU バックエンド
pub type CpuAutodiffBackend = Autodiff<CpuBackend>;

#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;
#[cfg(feature = "wgpu")]
pub type GpuAutodiffBackend = Autodiff<GpuBackend>;

/// 解決済みの計算デバイス
#[derive(Debug, Clone)]
pub enum ComputeDevice {
    Cpu(NdArrayDevice),
    #[cfg(feature = "wgpu")]
    Wgpu(burn_wgpu::WgpuDevice),
}

/// 設定値からデバイスを決定
///
/// `Auto` は wgpu 機能付きでビルドされていればアクセラレータ、なければCPU。
pub fn resolve_device(device_type: DeviceType) -> ComputeDevice {
    let device = match device_type {
        DeviceType::Cpu => ComputeDevice::Cpu(NdArrayDevice::Cpu),
        #[cfg(feature = "wgpu")]
        DeviceType::Auto | DeviceType::Wgpu => {
            ComputeDevice::Wgpu(burn_wgpu::WgpuDevice::DefaultDevice)
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Auto => ComputeDevice::Cpu(NdArrayDevice::Cpu),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("wgpu 機能なしでビルドされています。CPU (NdArray) を使用します");
            ComputeDevice::Cpu(NdArrayDevice::Cpu)
        }
    };
    info!("使用デバイス: {:?}", device);
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_available() {
        assert!(matches!(resolve_device(DeviceType::Cpu), ComputeDevice::Cpu(_)));
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn auto_and_wgpu_fall_back_to_cpu_without_feature() {
        assert!(matches!(resolve_device(DeviceType::Auto), ComputeDevice::Cpu(_)));
        assert!(matches!(resolve_device(DeviceType::Wgpu), ComputeDevice::Cpu(_)));
    }
}
