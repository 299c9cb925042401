//! Device mounters
//!
//! The block node agent works through a small capability set that all
//! attachment flavors share; iSCSI implements the session operations for
//! real, while the paravirtualized and UHP flavors stub them out (the
//! hypervisor, or the host block-volume management agent, owns the session
//! there).

pub mod iscsi;
pub mod mount;
pub mod uhp;

use async_trait::async_trait;

use crate::disk::iscsi::{IscsiDisk, IscsiSession};
use crate::disk::mount::{device_matches, Mounter};
use crate::error::Result;
use crate::util::CommandRunnerRef;

/// Capability set shared by all block attachment flavors.
#[async_trait]
pub trait DeviceMounter: Send + Sync {
    async fn add_to_db(&self) -> Result<()>;
    async fn set_automatic_login(&self) -> Result<()>;
    async fn login(&self) -> Result<()>;
    async fn logout(&self) -> Result<()>;
    async fn remove_from_db(&self) -> Result<()>;
    async fn update_queue_depth(&self) -> Result<()>;

    /// Blocks until the host can see the volume's paths.
    async fn wait_for_volume_login(&self) -> Result<()>;

    async fn wait_for_device_path(&self, path: &str, max_retries: u32) -> bool;

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;
    async fn unmount_path(&self, path: &str) -> Result<()>;

    async fn device_opened(&self, device: &str) -> Result<bool>;
    async fn rescan(&self, device_path: &str) -> Result<()>;
    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<bool>;
    async fn get_disk_format(&self, device_path: &str) -> Result<Option<String>>;
    async fn get_block_size_bytes(&self, device_path: &str) -> Result<i64>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn DeviceMounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn DeviceMounter")
    }
}

/// Shared default implementations delegating to [`Mounter`].
pub(crate) async fn device_opened_in(mounter: &Mounter, device: &str) -> Result<bool> {
    if tokio::fs::metadata(device).await.is_err() {
        return Ok(false);
    }
    let resolved = mount::resolve_device(device).unwrap_or_else(|_| device.to_string());
    let mounts = mounter.read_mount_points().await?;
    Ok(mounts
        .iter()
        .any(|m| device_matches(&m.device, device) || device_matches(&m.device, &resolved)))
}

// =============================================================================
// iSCSI Flavor
// =============================================================================

/// Single-path iSCSI attachment.
pub struct IscsiDeviceMounter {
    session: IscsiSession,
    mounter: Mounter,
}

impl IscsiDeviceMounter {
    pub fn new(runner: CommandRunnerRef, disk: IscsiDisk) -> Self {
        IscsiDeviceMounter {
            session: IscsiSession::new(runner.clone(), disk),
            mounter: Mounter::new(runner),
        }
    }

    pub fn disk(&self) -> &IscsiDisk {
        self.session.disk()
    }
}

#[async_trait]
impl DeviceMounter for IscsiDeviceMounter {
    async fn add_to_db(&self) -> Result<()> {
        self.session.add_to_db().await
    }

    async fn set_automatic_login(&self) -> Result<()> {
        self.session.set_automatic_login().await
    }

    async fn login(&self) -> Result<()> {
        self.session.login().await
    }

    async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    async fn remove_from_db(&self) -> Result<()> {
        self.session.remove_from_db().await
    }

    async fn update_queue_depth(&self) -> Result<()> {
        self.session.update_queue_depth().await
    }

    async fn wait_for_volume_login(&self) -> Result<()> {
        // The explicit login above is synchronous for single-path iSCSI.
        Ok(())
    }

    async fn wait_for_device_path(&self, path: &str, max_retries: u32) -> bool {
        mount::wait_for_path_to_exist(path, max_retries).await
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        self.mounter
            .format_and_mount(source, target, fs_type, options)
            .await
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        self.mounter.mount(source, target, fs_type, options).await
    }

    async fn unmount_path(&self, path: &str) -> Result<()> {
        self.mounter.unmount_path(path).await
    }

    async fn device_opened(&self, device: &str) -> Result<bool> {
        device_opened_in(&self.mounter, device).await
    }

    async fn rescan(&self, device_path: &str) -> Result<()> {
        self.mounter.rescan(device_path).await
    }

    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<bool> {
        self.mounter.resize(device_path, volume_path).await
    }

    async fn get_disk_format(&self, device_path: &str) -> Result<Option<String>> {
        self.mounter.get_disk_format(device_path).await
    }

    async fn get_block_size_bytes(&self, device_path: &str) -> Result<i64> {
        self.mounter.get_block_size_bytes(device_path).await
    }
}

// =============================================================================
// Paravirtualized Flavor
// =============================================================================

/// Hypervisor-mediated attachment; no iSCSI session to manage.
pub struct ParavirtualizedDeviceMounter {
    mounter: Mounter,
}

impl ParavirtualizedDeviceMounter {
    pub fn new(runner: CommandRunnerRef) -> Self {
        ParavirtualizedDeviceMounter {
            mounter: Mounter::new(runner),
        }
    }
}

#[async_trait]
impl DeviceMounter for ParavirtualizedDeviceMounter {
    async fn add_to_db(&self) -> Result<()> {
        Ok(())
    }

    async fn set_automatic_login(&self) -> Result<()> {
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_from_db(&self) -> Result<()> {
        Ok(())
    }

    async fn update_queue_depth(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_volume_login(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_device_path(&self, path: &str, max_retries: u32) -> bool {
        mount::wait_for_path_to_exist(path, max_retries).await
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        self.mounter
            .format_and_mount(source, target, fs_type, options)
            .await
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        self.mounter.mount(source, target, fs_type, options).await
    }

    async fn unmount_path(&self, path: &str) -> Result<()> {
        self.mounter.unmount_path(path).await
    }

    async fn device_opened(&self, device: &str) -> Result<bool> {
        device_opened_in(&self.mounter, device).await
    }

    async fn rescan(&self, device_path: &str) -> Result<()> {
        self.mounter.rescan(device_path).await
    }

    async fn resize(&self, device_path: &str, volume_path: &str) -> Result<bool> {
        self.mounter.resize(device_path, volume_path).await
    }

    async fn get_disk_format(&self, device_path: &str) -> Result<Option<String>> {
        self.mounter.get_disk_format(device_path).await
    }

    async fn get_block_size_bytes(&self, device_path: &str) -> Result<i64> {
        self.mounter.get_block_size_bytes(device_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mount::tests::FakeRunner;

    #[tokio::test]
    async fn test_paravirtualized_session_ops_are_noops() {
        let runner = FakeRunner::new();
        let mounter = ParavirtualizedDeviceMounter::new(runner.clone());
        mounter.add_to_db().await.unwrap();
        mounter.login().await.unwrap();
        mounter.logout().await.unwrap();
        mounter.update_queue_depth().await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_opened_missing_device() {
        let runner = FakeRunner::new();
        let mounter = ParavirtualizedDeviceMounter::new(runner);
        assert!(!mounter.device_opened("/dev/nonexistent0").await.unwrap());
    }
}
