//! First-boot configuration of deployed instances.
//!
//! The driver hands the boot configuration to the guest as the base64
//! `user-data` OVF property. [`CloudInitConfiguration`] renders a user-data
//! shell script that configures the static control address, logs into the
//! container registry, writes the node agent configuration and starts the
//! agent container.

use std::net::Ipv4Addr;

use base64::Engine;
use persephone_orchestration::{ClusterId, Genesis, ModelSpecification, NodeId, ResourceUri};
use serde::Serialize;
use thiserror::Error;

use crate::config::RegistryConfig;

#[derive(Debug, Error)]
pub enum BootConfigError {
    #[error("model {0} has no node agent image")]
    MissingAgentImage(String),

    #[error("invalid container registry address {0:?}")]
    InvalidRegistry(String),

    #[error("failed to encode agent configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything a boot configuration may depend on.
#[derive(Debug, Clone, Copy)]
pub struct BootParameters<'a> {
    pub cluster: ClusterId,
    pub node: NodeId,
    pub model: &'a ModelSpecification,
    pub genesis: &'a Genesis,
    pub registry: &'a RegistryConfig,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub name_servers: &'a [Ipv4Addr],
}

/// Opaque first-boot payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfiguration(String);

impl BootConfiguration {
    pub fn new(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0.as_bytes())
    }
}

/// Renders the first-boot payload of an instance.
pub trait BootConfigBuilder: Send + Sync {
    fn build(&self, params: &BootParameters<'_>) -> Result<BootConfiguration, BootConfigError>;
}

/// Configuration the node agent reads from `/config/agent/config.json`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentConfiguration<'a> {
    model: &'a ModelSpecification,
    genesis: &'a Genesis,
    container_registry: &'a RegistryConfig,
    cluster: String,
    node: String,
}

// Docker daemon log rotation, applied before the daemon restarts.
const DOCKER_DAEMON_CONFIG: &str = r#"mkdir -p /etc/docker
echo '{"log-driver": "json-file", "log-opts": { "max-size": "100m", "max-file": "5"}}' > /etc/docker/daemon.json
systemctl restart docker
systemctl enable docker"#;

// Guest address reporting through VMware Tools, skipping container interfaces.
const GUEST_INFO_CONFIG: &str = r#"touch /etc/vmware-tools/tools.conf
printf '[guestinfo]\nprimary-nics=eth*\nexclude-nics=docker*,veth*' > /etc/vmware-tools/tools.conf
/usr/bin/vmware-toolbox-cmd info update network"#;

/// Cloud-init user-data script builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudInitConfiguration;

impl CloudInitConfiguration {
    fn network_setup(params: &BootParameters<'_>) -> String {
        let dns = if params.name_servers.is_empty() {
            String::new()
        } else {
            let servers: Vec<_> = params.name_servers.iter().map(|s| s.to_string()).collect();
            format!("\\nDNS={}", servers.join(" "))
        };
        format!(
            "echo -e \"[Match]\\nName=eth0\\n\\n[Network]\\nAddress={}/{}\\nGateway={}{}\" \
             > /etc/systemd/network/10-eth0-static.network; \
             chmod 644 /etc/systemd/network/10-eth0-static.network; \
             systemctl restart systemd-networkd;",
            params.address, params.prefix_len, params.gateway, dns
        )
    }

    fn docker_dns(params: &BootParameters<'_>) -> String {
        params
            .name_servers
            .iter()
            .map(|server| format!("--dns {server}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn registry_login(registry: &RegistryConfig) -> String {
        match (&registry.username, &registry.password) {
            (Some(username), Some(password)) => format!(
                "docker login {} -u {} -p {}",
                registry.address,
                username,
                shell_quote(password)
            ),
            _ => format!("docker login {}", registry.address),
        }
    }
}

impl BootConfigBuilder for CloudInitConfiguration {
    fn build(&self, params: &BootParameters<'_>) -> Result<BootConfiguration, BootConfigError> {
        let agent_image = params
            .model
            .agent_image()
            .ok_or_else(|| BootConfigError::MissingAgentImage(params.model.version.clone()))?;

        let registry: ResourceUri = params
            .registry
            .address
            .parse()
            .map_err(|_| BootConfigError::InvalidRegistry(params.registry.address.clone()))?;
        let registry_host = registry
            .authority()
            .ok_or_else(|| BootConfigError::InvalidRegistry(params.registry.address.clone()))?;
        let registry_security = match registry.scheme() {
            Some("http") => format!("--insecure-registry {registry_host}"),
            _ => String::new(),
        };

        let agent_config = serde_json::to_string(&AgentConfiguration {
            model: params.model,
            genesis: params.genesis,
            container_registry: params.registry,
            cluster: params.cluster.to_string(),
            node: params.node.to_string(),
        })?;

        // Embedded in a single-quoted echo.
        let agent_config = agent_config.replace('\'', r"'\''");
        let network_setup = Self::network_setup(params);
        let docker_dns = Self::docker_dns(params);
        let registry_login = Self::registry_login(params.registry);

        let script = format!(
            "#!/bin/sh\n\
             {network_setup}\n\
             \n\
             sed -i 's_/usr/bin/dockerd.*_/usr/bin/dockerd {docker_dns} -H tcp://127.0.0.1:2375 \
             -H unix:///var/run/docker.sock {registry_security}_g' /lib/systemd/system/docker.service\n\
             systemctl daemon-reload\n\
             \n\
             {DOCKER_DAEMON_CONFIG}\n\
             \n\
             {registry_login}\n\
             \n\
             mkdir -p /config/agent\n\
             echo '{agent_config}' > /config/agent/config.json\n\
             \n\
             {GUEST_INFO_CONFIG}\n\
             \n\
             docker run -d --name=agent --restart=always -v /config:/config \
             -v /var/run/docker.sock:/var/run/docker.sock -p 8546:8546 {registry_host}/{agent_image}\n\
             echo 'done'\n"
        );

        Ok(BootConfiguration(script))
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The static control address a rendered user-data script configures, if any.
pub fn configured_address(user_data: &str) -> Option<Ipv4Addr> {
    let start = user_data.find("Address=")? + "Address=".len();
    let rest = &user_data[start..];
    let end = rest.find('/')?;
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use persephone_orchestration::{ComponentKind, ModelComponent, ServiceType};

    fn model() -> ModelSpecification {
        ModelSpecification {
            version: "1.2".into(),
            template: "blockchain-template".into(),
            components: vec![ModelComponent {
                kind: ComponentKind::ContainerImage,
                service_type: ServiceType::Generic,
                name: "vmwblockchain/agent:1.2".into(),
            }],
        }
    }

    fn registry(address: &str) -> RegistryConfig {
        RegistryConfig {
            address: address.into(),
            username: Some("deployer".into()),
            password: Some("it's-secret".into()),
        }
    }

    fn render(model: &ModelSpecification, registry: &RegistryConfig) -> Result<BootConfiguration, BootConfigError> {
        let genesis = Genesis::default();
        let name_servers = [Ipv4Addr::new(10, 1, 0, 2), Ipv4Addr::new(10, 1, 0, 3)];
        CloudInitConfiguration.build(&BootParameters {
            cluster: ClusterId::new(1, 2),
            node: NodeId::new(3, 4),
            model,
            genesis: &genesis,
            registry,
            address: Ipv4Addr::new(10, 1, 0, 17),
            gateway: Ipv4Addr::new(10, 1, 0, 1),
            prefix_len: 16,
            name_servers: &name_servers,
        })
    }

    #[test]
    fn test_user_data_contents() {
        let config = render(&model(), &registry("https://registry.local")).unwrap();
        let script = config.as_str();

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("Address=10.1.0.17/16\\nGateway=10.1.0.1\\nDNS=10.1.0.2 10.1.0.3"));
        assert!(script.contains("--dns 10.1.0.2 --dns 10.1.0.3"));
        assert!(script.contains("docker login https://registry.local -u deployer -p 'it'\\''s-secret'"));
        assert!(script.contains("registry.local/vmwblockchain/agent:1.2"));
        assert!(!script.contains("--insecure-registry"));
        assert!(script.contains("\"chainId\":1"));
        assert!(script.contains("\"max-file\": \"5\""));
        assert!(script.contains("primary-nics=eth*"));
        assert!(script.contains("-H unix:///var/run/docker.sock _g'"));
        assert!(script.ends_with("-p 8546:8546 registry.local/vmwblockchain/agent:1.2\necho 'done'\n"));
        assert_eq!(configured_address(script), Some(Ipv4Addr::new(10, 1, 0, 17)));
    }

    #[test]
    fn test_plain_http_registry_is_insecure() {
        let config = render(&model(), &registry("http://registry.local:5000")).unwrap();
        assert!(config.as_str().contains("--insecure-registry registry.local:5000"));
    }

    #[test]
    fn test_model_without_agent_is_rejected() {
        let mut model = model();
        model.components.clear();
        assert!(matches!(
            render(&model, &registry("https://registry.local")),
            Err(BootConfigError::MissingAgentImage(_))
        ));
    }

    #[test]
    fn test_base64_payload() {
        let config = BootConfiguration::new("#!/bin/sh\necho hi\n");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(config.to_base64())
            .unwrap();
        assert_eq!(decoded, config.as_str().as_bytes());
    }
}
