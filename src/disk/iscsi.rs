//! iSCSI session management
//!
//! Wraps `iscsiadm` for the single-path block attachment: node database
//! record, automatic login, login/logout, and the queue-depth tuning the
//! higher performance tier asks for.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::util::CommandRunnerRef;

/// Queue depth applied when the volume is on the higher performance tier.
pub const HIGH_TIER_QUEUE_DEPTH: u32 = 128;

/// Identity of an iSCSI target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiDisk {
    pub iqn: String,
    pub ip: String,
    pub port: i32,
}

impl IscsiDisk {
    pub fn new(iqn: &str, ip: &str, port: i32) -> Self {
        IscsiDisk {
            iqn: iqn.to_string(),
            ip: ip.to_string(),
            port,
        }
    }

    /// `ip:port` target portal.
    pub fn target(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Recovers the target identity from a by-path device name.
    pub fn from_device_path(device_path: &str) -> Result<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"ip-([\w\.]+):(\d+)-iscsi-([\w\.\-:]+)-lun-\d+$").unwrap()
        });
        let captures = re
            .captures(device_path)
            .ok_or_else(|| Error::InvalidArgument(format!(
                "device path {} is not an iscsi by-path name",
                device_path
            )))?;
        let port: i32 = captures[2].parse().map_err(|_| {
            Error::InvalidArgument(format!("bad port in device path {}", device_path))
        })?;
        Ok(IscsiDisk::new(&captures[3], &captures[1], port))
    }

    /// Expected by-path device name for LUN 1.
    pub fn device_path(&self) -> String {
        crate::util::iscsi_device_path(&self.ip, self.port, &self.iqn)
    }
}

/// iscsiadm operations against one target.
#[derive(Clone)]
pub struct IscsiSession {
    runner: CommandRunnerRef,
    disk: IscsiDisk,
}

impl IscsiSession {
    pub fn new(runner: CommandRunnerRef, disk: IscsiDisk) -> Self {
        IscsiSession { runner, disk }
    }

    pub fn disk(&self) -> &IscsiDisk {
        &self.disk
    }

    async fn iscsiadm(&self, args: &[&str]) -> Result<String> {
        debug!(target = %self.disk.target(), iqn = %self.disk.iqn, ?args, "iscsiadm");
        self.runner.run("iscsiadm", args).await
    }

    /// Registers the target in the local node database.
    pub async fn add_to_db(&self) -> Result<()> {
        let target = self.disk.target();
        self.iscsiadm(&["-m", "node", "-o", "new", "-T", &self.disk.iqn, "-p", &target])
            .await?;
        info!(iqn = %self.disk.iqn, "added iscsi node record");
        Ok(())
    }

    /// Marks the node record for automatic login on restart.
    pub async fn set_automatic_login(&self) -> Result<()> {
        self.iscsiadm(&[
            "-m",
            "node",
            "-o",
            "update",
            "-T",
            &self.disk.iqn,
            "-n",
            "node.startup",
            "-v",
            "automatic",
        ])
        .await?;
        Ok(())
    }

    /// Raises the session queue depth for the higher performance tier.
    pub async fn update_queue_depth(&self) -> Result<()> {
        let target = self.disk.target();
        let depth = HIGH_TIER_QUEUE_DEPTH.to_string();
        self.iscsiadm(&[
            "-m",
            "node",
            "-T",
            &self.disk.iqn,
            "-p",
            &target,
            "-o",
            "update",
            "-n",
            "node.session.queue_depth",
            "-v",
            &depth,
        ])
        .await?;
        info!(iqn = %self.disk.iqn, depth = HIGH_TIER_QUEUE_DEPTH, "updated iscsi queue depth");
        Ok(())
    }

    pub async fn login(&self) -> Result<()> {
        let target = self.disk.target();
        self.iscsiadm(&["-m", "node", "-T", &self.disk.iqn, "-p", &target, "-l"])
            .await?;
        info!(iqn = %self.disk.iqn, "iscsi login complete");
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let target = self.disk.target();
        self.iscsiadm(&["-m", "node", "-T", &self.disk.iqn, "-p", &target, "-u"])
            .await?;
        info!(iqn = %self.disk.iqn, "iscsi logout complete");
        Ok(())
    }

    /// Removes the node database record.
    pub async fn remove_from_db(&self) -> Result<()> {
        let target = self.disk.target();
        self.iscsiadm(&[
            "-m",
            "node",
            "-o",
            "delete",
            "-T",
            &self.disk.iqn,
            "-p",
            &target,
        ])
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mount::tests::FakeRunner;

    #[test]
    fn test_from_device_path() {
        let disk = IscsiDisk::from_device_path(
            "/dev/disk/by-path/ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:472a-lun-1",
        )
        .unwrap();
        assert_eq!(disk.ip, "169.254.2.2");
        assert_eq!(disk.port, 3260);
        assert_eq!(disk.iqn, "iqn.2015-12.com.oracleiaas:472a");
        assert_eq!(
            disk.device_path(),
            "/dev/disk/by-path/ip-169.254.2.2:3260-iscsi-iqn.2015-12.com.oracleiaas:472a-lun-1"
        );
    }

    #[test]
    fn test_from_device_path_rejects_other_devices() {
        assert!(IscsiDisk::from_device_path("/dev/sda").is_err());
        assert!(
            IscsiDisk::from_device_path("/dev/disk/by-path/pci-0000:00:04.0-scsi-0:0:0:1").is_err()
        );
    }

    #[tokio::test]
    async fn test_session_command_shapes() {
        let runner = FakeRunner::new();
        let session = IscsiSession::new(
            runner.clone(),
            IscsiDisk::new("iqn.2015-12.com.oracleiaas:472a", "169.254.2.2", 3260),
        );
        session.add_to_db().await.unwrap();
        session.set_automatic_login().await.unwrap();
        session.login().await.unwrap();
        session.update_queue_depth().await.unwrap();
        session.logout().await.unwrap();
        session.remove_from_db().await.unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            "iscsiadm -m node -o new -T iqn.2015-12.com.oracleiaas:472a -p 169.254.2.2:3260"
        );
        assert!(calls[1].contains("node.startup -v automatic"));
        assert!(calls[2].ends_with("-l"));
        assert!(calls[3].contains("node.session.queue_depth -v 128"));
        assert!(calls[4].ends_with("-u"));
        assert!(calls[5].contains("-o delete"));
    }
}
