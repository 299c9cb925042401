//! LNet configuration for Lustre mounts
//!
//! Staging a Lustre volume may ask for LNet to be brought up first: load
//! the kernel module, start the LNet service, and make sure every VNIC in
//! the Lustre subnet carries an up-to-date network interface entry under
//! the requested network label (for example `tcp0`). Entries whose NID no
//! longer matches the interface address, or whose status is down, are
//! treated as stale and rebuilt.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::util::CommandRunnerRef;

const LNET_KERNEL_MODULE: &str = "lnet";
const LUSTRE_CLIENT_PROBE: &str = "lfs";

/// One `lnetctl net show --net <label>` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetInfo {
    #[serde(default)]
    pub net: Vec<NetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetEntry {
    #[serde(rename = "net type", default)]
    pub net_type: String,
    #[serde(rename = "local NI(s)", default)]
    pub local_nis: Vec<LocalNi>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalNi {
    #[serde(default)]
    pub nid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub interfaces: HashMap<i32, String>,
}

impl LocalNi {
    fn primary_interface(&self) -> Option<&str> {
        self.interfaces.get(&0).map(|s| s.as_str())
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// Host network interface that falls inside the Lustre subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub lnet_configured: bool,
}

impl NetInterface {
    fn nid(&self, label: &str) -> String {
        format!("{}@{}", self.ipv4, label)
    }
}

/// IPv4 subnet in `a.b.c.d/len` form.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Cidr {
    network: u32,
    mask: u32,
}

impl Ipv4Cidr {
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, len) = cidr.split_once('/').ok_or_else(|| {
            Error::InvalidArgument(format!("subnet CIDR {} is missing a prefix length", cidr))
        })?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad address in subnet CIDR {}", cidr)))?;
        let len: u32 = len
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad prefix length in subnet CIDR {}", cidr)))?;
        if len > 32 {
            return Err(Error::InvalidArgument(format!(
                "bad prefix length in subnet CIDR {}",
                cidr
            )));
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Ok(Ipv4Cidr {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

/// Manages LNet state on the worker node through `lnetctl` and friends.
#[derive(Clone)]
pub struct LnetService {
    runner: CommandRunnerRef,
}

impl LnetService {
    pub fn new(runner: CommandRunnerRef) -> Self {
        LnetService { runner }
    }

    /// Brings LNet up for the given network label, configuring an interface
    /// entry for every VNIC inside the Lustre subnet.
    pub async fn setup(&self, lustre_subnet_cidr: &str, lnet_label: &str) -> Result<()> {
        info!(lustre_subnet_cidr, lnet_label, "lnet setup started");

        let mut interfaces = self.interfaces_in_subnet(lustre_subnet_cidr).await?;
        if interfaces.is_empty() {
            return Err(Error::FailedPrecondition(
                "no VNIC identified on worker node to configure lnet".to_string(),
            ));
        }
        info!(?interfaces, "net interfaces identified for lnet configuration");

        // The client package probe is only advisory; when the kernel module
        // or service fails to come up it tells the operator what to install.
        let client_installed = self.is_lustre_client_installed().await;

        if let Err(err) = self.runner.run("modprobe", &[LNET_KERNEL_MODULE]).await {
            if !client_installed {
                return Err(Error::FailedPrecondition(format!(
                    "failed to load lnet kernel module: {}. Please make sure that lustre client packages are installed on worker nodes",
                    err
                )));
            }
            return Err(err);
        }
        if let Err(err) = self.runner.run("lnetctl", &["lnet", "configure"]).await {
            if !client_installed {
                return Err(Error::FailedPrecondition(format!(
                    "failed to configure lnet kernel service: {}. Please make sure that lustre client packages are installed on worker nodes",
                    err
                )));
            }
            return Err(err);
        }

        let net_info = self.net_info(lnet_label).await?;
        self.configure(&mut interfaces, lnet_label, &net_info).await?;
        self.verify(&interfaces, lnet_label).await;
        Ok(())
    }

    /// True when at least one network interface under the label is up.
    pub async fn is_active(&self, lnet_label: &str) -> bool {
        let net_info = match self.net_info(lnet_label).await {
            Ok(info) => info,
            Err(err) => {
                error!(lnet_label, %err, "failed to get lnet info");
                return false;
            }
        };
        let mut active = false;
        for net in &net_info.net {
            for ni in &net.local_nis {
                if ni.is_up() {
                    active = true;
                } else {
                    error!(nid = %ni.nid, status = %ni.status, "lnet interface is not up");
                }
            }
        }
        if !active {
            error!("no active lnet interface is identified");
        }
        active
    }

    async fn is_lustre_client_installed(&self) -> bool {
        match self.runner.run(LUSTRE_CLIENT_PROBE, &["--version"]).await {
            Ok(_) => true,
            Err(err) => {
                error!(%err, "lustre client package check failed");
                false
            }
        }
    }

    /// Host interfaces whose IPv4 address falls inside the subnet.
    pub async fn interfaces_in_subnet(&self, subnet_cidr: &str) -> Result<Vec<NetInterface>> {
        let subnet = Ipv4Cidr::parse(subnet_cidr)?;
        let listing = self.runner.run("ip", &["-o", "-4", "addr", "show"]).await?;
        let mut matching = Vec::new();
        for line in listing.lines() {
            // Each line reads `2: ens3 inet 10.0.2.2/24 brd ...`.
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (name, addr) = match (fields.get(1), fields.get(3)) {
                (Some(name), Some(addr)) => (*name, *addr),
                _ => continue,
            };
            let ip = match addr.split('/').next().and_then(|a| a.parse::<Ipv4Addr>().ok()) {
                Some(ip) => ip,
                None => continue,
            };
            if subnet.contains(ip) {
                matching.push(NetInterface {
                    name: name.to_string(),
                    ipv4: ip,
                    lnet_configured: false,
                });
            }
        }
        Ok(matching)
    }

    async fn net_info(&self, lnet_label: &str) -> Result<NetInfo> {
        let output = self
            .runner
            .run("lnetctl", &["net", "show", "--net", lnet_label])
            .await?;
        if output.trim().is_empty() {
            return Ok(NetInfo::default());
        }
        let info: NetInfo = serde_yaml::from_str(&output)?;
        Ok(info)
    }

    /// Adds missing interface entries under the label and rebuilds stale
    /// ones. An entry is stale when its interface name matches but the NID
    /// does not, or when it is down (the VNIC may have been detached).
    async fn configure(
        &self,
        interfaces: &mut [NetInterface],
        lnet_label: &str,
        net_info: &NetInfo,
    ) -> Result<()> {
        debug!(?net_info, "existing lnet information");

        let mut stale = Vec::new();
        for iface in interfaces.iter_mut() {
            for net in &net_info.net {
                for ni in &net.local_nis {
                    let existing = match ni.primary_interface() {
                        Some(name) => name,
                        None => continue,
                    };
                    if ni.is_up() && existing == iface.name {
                        if ni.nid == iface.nid(lnet_label) {
                            iface.lnet_configured = true;
                        } else {
                            stale.push(existing.to_string());
                        }
                    } else if !ni.is_up() {
                        stale.push(existing.to_string());
                    }
                }
            }
        }

        if !stale.is_empty() {
            info!(?stale, "deleting stale lnet interfaces");
            self.runner
                .run("lnetctl", &["net", "del", "--net", lnet_label])
                .await
                .map_err(|err| {
                    Error::Internal(format!(
                        "failed to delete stale lnet interfaces {:?}: {}",
                        stale, err
                    ))
                })?;
        }
        for iface in interfaces.iter() {
            if iface.lnet_configured && stale.is_empty() {
                continue;
            }
            self.runner
                .run(
                    "lnetctl",
                    &[
                        "net",
                        "add",
                        "--net",
                        lnet_label,
                        "--if",
                        &iface.name,
                        "--peer-timeout",
                        "180",
                        "--peer-credits",
                        "120",
                        "--credits",
                        "1024",
                    ],
                )
                .await
                .map_err(|_| {
                    Error::Internal(format!("lnet configuration failed for interface {}", iface.name))
                })?;
        }
        Ok(())
    }

    /// Checks the final state and logs any interface that did not come up.
    /// Non-breaking: if LNet is still down at mount time the mount fails
    /// and the stage is retried.
    async fn verify(&self, interfaces: &[NetInterface], lnet_label: &str) {
        let net_info = match self.net_info(lnet_label).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "failed to read back lnet configuration");
                return;
            }
        };
        debug!(?net_info, "lnet information post configuration");

        let mut active = false;
        for iface in interfaces {
            for net in &net_info.net {
                for ni in &net.local_nis {
                    if ni.primary_interface() == Some(iface.name.as_str()) {
                        if ni.is_up() {
                            active = true;
                        } else {
                            error!(nid = %ni.nid, interface = %iface.name, status = %ni.status,
                                "lnet interface is not up");
                        }
                    }
                }
            }
        }
        if active {
            info!("lnet configuration completed and verified");
        } else {
            error!("no active lnet interface is identified");
        }
    }

    /// Applies `lctl set_param` for every entry of the post-mount parameter
    /// list. Any failure is fatal for the stage.
    pub async fn apply_lustre_parameters(&self, params_json: &str) -> Result<()> {
        if params_json.is_empty() {
            debug!("no lustre parameters specified");
            return Ok(());
        }
        let params: Vec<HashMap<String, serde_json::Value>> = serde_json::from_str(params_json)?;
        for param in &params {
            for (key, value) in param {
                let value = render_param_value(value);
                info!(%key, %value, "applying lustre param");
                let assignment = format!("{}={}", key, value);
                self.runner.run("lctl", &["set_param", &assignment]).await?;
            }
        }
        info!("successfully applied lustre parameters");
        Ok(())
    }
}

fn render_param_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_valid_lustre_param(param: &str) -> bool {
    if param.contains(' ') {
        return false;
    }
    const FORBIDDEN: &[char] = &[';', '&', '|', '<', '>', '(', ')', '`', '\'', '"'];
    !param.contains(FORBIDDEN)
}

/// Rejects parameter names and values that could smuggle shell syntax.
pub fn validate_lustre_parameters(params_json: &str) -> Result<()> {
    if params_json.is_empty() {
        return Ok(());
    }
    let params: Vec<HashMap<String, serde_json::Value>> = serde_json::from_str(params_json)?;
    let mut invalid = Vec::new();
    for param in &params {
        for (key, value) in param {
            let value = render_param_value(value);
            if !is_valid_lustre_param(key) || !is_valid_lustre_param(&value) {
                invalid.push(format!("{}={}", key, value));
            }
        }
    }
    if !invalid.is_empty() {
        return Err(Error::InvalidArgument(invalid.join(",")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mount::tests::FakeRunner;
    use crate::util::CommandOutput;

    const NET_SHOW_OUTPUT: &str = "\
net:
    - net type: tcp1
      local NI(s):
        - nid: 10.0.2.2@tcp1
          status: up
          interfaces:
              0: ens3
        - nid: 10.0.2.9@tcp1
          status: down
          interfaces:
              0: ens5
";

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_net_info_parses_lnetctl_yaml() {
        let info: NetInfo = serde_yaml::from_str(NET_SHOW_OUTPUT).unwrap();
        assert_eq!(info.net.len(), 1);
        assert_eq!(info.net[0].net_type, "tcp1");
        let nis = &info.net[0].local_nis;
        assert_eq!(nis.len(), 2);
        assert_eq!(nis[0].nid, "10.0.2.2@tcp1");
        assert!(nis[0].is_up());
        assert_eq!(nis[0].primary_interface(), Some("ens3"));
        assert!(!nis[1].is_up());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = Ipv4Cidr::parse("10.0.2.0/24").unwrap();
        assert!(cidr.contains("10.0.2.200".parse().unwrap()));
        assert!(!cidr.contains("10.0.3.1".parse().unwrap()));

        let single = Ipv4Cidr::parse("10.0.2.2/32").unwrap();
        assert!(single.contains("10.0.2.2".parse().unwrap()));
        assert!(!single.contains("10.0.2.3".parse().unwrap()));

        assert!(Ipv4Cidr::parse("10.0.2.0").is_err());
        assert!(Ipv4Cidr::parse("10.0.2.0/33").is_err());
    }

    #[tokio::test]
    async fn test_interfaces_in_subnet() {
        let runner = FakeRunner::new();
        runner.respond(
            "ip -o -4 addr show",
            ok("\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: ens3    inet 10.0.2.2/24 brd 10.0.2.255 scope global ens3\\       valid_lft forever preferred_lft forever
3: ens5    inet 192.168.1.4/24 brd 192.168.1.255 scope global ens5\\       valid_lft forever preferred_lft forever
"),
        );
        let service = LnetService::new(runner);
        let interfaces = service.interfaces_in_subnet("10.0.2.0/24").await.unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].name, "ens3");
        assert_eq!(interfaces[0].ipv4, "10.0.2.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_configure_rebuilds_stale_interfaces() {
        let runner = FakeRunner::new();
        let service = LnetService::new(runner.clone());
        let net_info: NetInfo = serde_yaml::from_str(NET_SHOW_OUTPUT).unwrap();

        // ens3 carries a NID for a previous address, ens5 is down.
        let mut interfaces = vec![NetInterface {
            name: "ens3".to_string(),
            ipv4: "10.0.2.7".parse().unwrap(),
            lnet_configured: false,
        }];
        service
            .configure(&mut interfaces, "tcp1", &net_info)
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], "lnetctl net del --net tcp1");
        assert!(calls[1].starts_with("lnetctl net add --net tcp1 --if ens3"));
        assert!(calls[1].contains("--peer-timeout 180 --peer-credits 120 --credits 1024"));
    }

    #[tokio::test]
    async fn test_configure_skips_already_configured_interface() {
        let runner = FakeRunner::new();
        let service = LnetService::new(runner.clone());
        let net_info: NetInfo = serde_yaml::from_str(
            "\
net:
    - net type: tcp1
      local NI(s):
        - nid: 10.0.2.2@tcp1
          status: up
          interfaces:
              0: ens3
",
        )
        .unwrap();

        let mut interfaces = vec![NetInterface {
            name: "ens3".to_string(),
            ipv4: "10.0.2.2".parse().unwrap(),
            lnet_configured: false,
        }];
        service
            .configure(&mut interfaces, "tcp1", &net_info)
            .await
            .unwrap();
        assert!(interfaces[0].lnet_configured);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_is_active() {
        let runner = FakeRunner::new();
        runner.respond("lnetctl net show --net tcp1", ok(NET_SHOW_OUTPUT));
        let service = LnetService::new(runner);
        assert!(service.is_active("tcp1").await);

        let runner = FakeRunner::new();
        runner.respond("lnetctl net show --net tcp1", ok(""));
        let service = LnetService::new(runner);
        assert!(!service.is_active("tcp1").await);
    }

    #[tokio::test]
    async fn test_apply_lustre_parameters() {
        let runner = FakeRunner::new();
        let service = LnetService::new(runner.clone());
        service
            .apply_lustre_parameters(r#"[{"osc.*.checksums": 0}, {"llite.*.max_cached_mb": "75%"}]"#)
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], "lctl set_param osc.*.checksums=0");
        assert_eq!(calls[1], "lctl set_param llite.*.max_cached_mb=75%");
    }

    #[test]
    fn test_validate_lustre_parameters() {
        assert!(validate_lustre_parameters("").is_ok());
        assert!(validate_lustre_parameters(r#"[{"osc.*.checksums": 0}]"#).is_ok());
        assert!(validate_lustre_parameters(r#"[{"osc.*.checksums": "0; rm -rf /"}]"#).is_err());
        assert!(validate_lustre_parameters(r#"[{"a|b": 1}]"#).is_err());
        assert!(validate_lustre_parameters("not json").is_err());
    }
}
