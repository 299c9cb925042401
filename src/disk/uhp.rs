//! UHP (multipath iSCSI) device mounter
//!
//! Login is performed by the host block-volume management agent; the node
//! agent only waits for every path to surface under `/dev/disk/by-path`
//! and then works against the multipath friendly name. Rescans fan out to
//! every SCSI slave before resizing the multipath map.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::cloud::MultipathDevice;
use crate::disk::mount::{self, Mounter, DISK_BY_PATH_FOLDER};
use crate::disk::{device_opened_in, DeviceMounter};
use crate::error::{Error, Result};
use crate::util::CommandRunnerRef;

/// Ceiling on waiting for the host agent to log all paths in.
const VOLUME_LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct UhpDeviceMounter {
    mounter: Mounter,
    multipath_devices: Vec<MultipathDevice>,
}

impl UhpDeviceMounter {
    pub fn new(runner: CommandRunnerRef, multipath_devices: Vec<MultipathDevice>) -> Self {
        UhpDeviceMounter {
            mounter: Mounter::new(runner),
            multipath_devices,
        }
    }

    /// True when every path of the volume is visible under the by-path
    /// folder.
    async fn all_paths_logged_in(&self) -> Result<bool> {
        let listing = self
            .mounter
            .runner()
            .run("ls", &["-f", DISK_BY_PATH_FOLDER])
            .await?;
        for device in &self.multipath_devices {
            let needle = format!("ip-{}:{}-iscsi-{}", device.ipv4, device.port, device.iqn);
            if !listing.contains(&needle) {
                debug!(path = %needle, "multipath path not yet visible");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl DeviceMounter for UhpDeviceMounter {
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
        let wait = async {
            loop {
                if self.all_paths_logged_in().await? {
                    info!("all multipath iscsi paths are logged in");
                    return Ok(());
                }
                sleep(LOGIN_POLL_INTERVAL).await;
            }
        };
        match timeout(VOLUME_LOGIN_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(
                "automatic login through the block volume management agent".to_string(),
            )),
        }
    }

    async fn wait_for_device_path(&self, _path: &str, _max_retries: u32) -> bool {
        // The multipath friendly name is resolved separately; nothing to
        // wait for here.
        true
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

    /// Rescans every SCSI slave of the multipath device, then resizes the
    /// multipath map.
    async fn rescan(&self, device_path: &str) -> Result<()> {
        let mapper_path = mount::resolve_device(device_path)?;
        let base = std::path::Path::new(&mapper_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Internal(format!("cannot derive device name from {}", mapper_path))
            })?;

        let slaves_dir = format!("/sys/block/{}/slaves", base);
        let mut entries = tokio::fs::read_dir(&slaves_dir).await.map_err(|err| {
            Error::Internal(format!("failed to list multipath slaves {}: {}", slaves_dir, err))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("sd") {
                continue;
            }
            let cmd = format!("echo 1 | tee /sys/block/{}/device/rescan", name);
            self.mounter.runner().run("bash", &["-c", &cmd]).await?;
            debug!(slave = %name, "rescanned multipath slave");
        }

        let resize_cmd = format!("multipathd resize map {}", base);
        self.mounter.runner().run("bash", &["-c", &resize_cmd]).await?;
        info!(device_path, map = %base, "resized multipath map");
        Ok(())
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
    use crate::util::CommandOutput;

    fn devices() -> Vec<MultipathDevice> {
        vec![
            MultipathDevice {
                ipv4: "169.254.2.2".into(),
                port: 3260,
                iqn: "iqn.2015-12.com.oracleiaas:aaaa".into(),
            },
            MultipathDevice {
                ipv4: "169.254.2.3".into(),
                port: 3260,
                iqn: "iqn.2015-12.com.oracleiaas:bbbb".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_all_paths_logged_in() {
        let runner = FakeRunner::new();
        runner.respond(
            "ls -f",
            CommandOutput {
                code: 0,
                stdout: "\
ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:aaaa-lun-1
ip-169.254.2.3:3260-iscsi-iqn.2015-12.com.oracleiaas:bbbb-lun-1
"
                .to_string(),
                stderr: String::new(),
            },
        );
        let mounter = UhpDeviceMounter::new(runner, devices());
        assert!(mounter.all_paths_logged_in().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_path_not_logged_in() {
        let runner = FakeRunner::new();
        runner.respond(
            "ls -f",
            CommandOutput {
                code: 0,
                stdout: "ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:aaaa-lun-1\n"
                    .to_string(),
                stderr: String::new(),
            },
        );
        let mounter = UhpDeviceMounter::new(runner, devices());
        assert!(!mounter.all_paths_logged_in().await.unwrap());
    }

    #[tokio::test]
    async fn test_session_ops_are_noops() {
        let runner = FakeRunner::new();
        let mounter = UhpDeviceMounter::new(runner.clone(), devices());
        mounter.add_to_db().await.unwrap();
        mounter.login().await.unwrap();
        mounter.logout().await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
