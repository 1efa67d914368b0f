//! Binding probe: one-shot environment inspection producing the pod
//! descriptor skeleton and the agent configuration.
//!
//! All settings are plain `ochopod_*` key/value pairs plus whatever the
//! orchestrator exports (`PORT_<n>` remappings, application and task labels).
//! A probe failure is fatal and exits the agent with code 1.

use crate::config::{AgentConfig, DEFAULT_CONTROL_PORT, DEFAULT_NAMESPACE};
use crate::error::{AgentError, Result};
use crate::types::{ClusterKey, PodDescriptor, PodRole, ProcessState};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Candidate files carrying the coordination connect string on hosts where
/// it is not passed through the environment.
const DISCOVERY_FILES: &[&str] = &["/etc/mesos/zk", "/opt/mesosphere/etc/mesos-slave-common"];

/// Probe the environment and build the configuration plus the descriptor
/// skeleton (seq is assigned later, at registration).
pub fn probe(env: &HashMap<String, String>) -> Result<(AgentConfig, PodDescriptor)> {
    let lookup = |key: &str| env.get(key).map(String::as_str).filter(|v| !v.is_empty());

    let cluster_name = lookup("ochopod_cluster")
        .ok_or_else(|| AgentError::Binding("ochopod_cluster not set".into()))?;
    let namespace = lookup("ochopod_namespace").unwrap_or(DEFAULT_NAMESPACE);
    let cluster = ClusterKey::new(namespace, cluster_name);

    let control_port: u16 = match lookup("ochopod_port") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AgentError::Binding(format!("bad ochopod_port {:?}", raw)))?,
        None => DEFAULT_CONTROL_PORT,
    };

    // Orchestrator port remappings, e.g. PORT_8080=1024.
    let mut ports: BTreeMap<String, u16> = BTreeMap::new();
    for (key, value) in env {
        if let Some(exposed) = key.strip_prefix("PORT_") {
            let mapped: u16 = value
                .parse()
                .map_err(|_| AgentError::Binding(format!("bad remapping {}={}", key, value)))?;
            ports.insert(exposed.to_string(), mapped);
        }
    }
    // Identity-map the control port when running without a remapping layer.
    ports
        .entry(control_port.to_string())
        .or_insert(control_port);

    let application = lookup("ochopod_application")
        .map(str::to_string)
        .or_else(|| {
            lookup("MARATHON_APP_ID").map(|id| id.trim_start_matches('/').to_string())
        })
        .unwrap_or_else(|| cluster_name.to_string());

    let node = lookup("HOST").unwrap_or("local").to_string();
    let task = lookup("MESOS_TASK_ID").unwrap_or_default().to_string();
    let ip = lookup("LIBPROCESS_IP")
        .or_else(|| lookup("HOST").filter(|h| h.parse::<std::net::IpAddr>().is_ok()))
        .unwrap_or("127.0.0.1")
        .to_string();

    let config = AgentConfig {
        cluster: cluster.clone(),
        application: application.clone(),
        control_port,
        endpoints: discover_endpoints(env),
        debug: lookup("ochopod_debug") == Some("true"),
        autostart: lookup("ochopod_start") != Some("false"),
        session_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    config.validate()?;

    let descriptor = PodDescriptor {
        node,
        task,
        public: ip.clone(),
        ip,
        ports,
        port: control_port.to_string(),
        application,
        cluster,
        process: ProcessState::Stopped,
        state: PodRole::Follower,
        uuid: Uuid::new_v4(),
        seq: 0,
    };

    info!(
        cluster = %descriptor.cluster,
        uuid = %descriptor.uuid,
        "binding probe complete"
    );
    Ok((config, descriptor))
}

/// Probe using the process environment.
pub fn probe_from_env() -> Result<(AgentConfig, PodDescriptor)> {
    let env: HashMap<String, String> = std::env::vars().collect();
    probe(&env)
}

/// Resolve the coordination connect string: `ochopod_zk` wins, then the
/// usual on-host locations, then localhost as a last resort.
fn discover_endpoints(env: &HashMap<String, String>) -> Vec<String> {
    if let Some(raw) = env.get("ochopod_zk").filter(|v| !v.is_empty()) {
        return split_connect_string(raw);
    }

    for candidate in DISCOVERY_FILES {
        if let Ok(contents) = std::fs::read_to_string(candidate) {
            for line in contents.lines() {
                if let Some(idx) = line.find("zk://") {
                    debug!(file = candidate, "discovered coordination endpoints");
                    return split_connect_string(&line[idx..]);
                }
            }
        }
    }

    vec!["127.0.0.1:2181".to_string()]
}

/// Turn `zk://a:2181,b:2181/chroot` (or a bare `a:2181,b:2181`) into a list
/// of `host:port` endpoints.
fn split_connect_string(raw: &str) -> Vec<String> {
    let trimmed = raw.trim().trim_start_matches("zk://");
    let hosts = trimmed.split('/').next().unwrap_or(trimmed);
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}
