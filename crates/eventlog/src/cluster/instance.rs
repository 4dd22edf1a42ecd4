// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Create,
    Update,
    Abnormal,
    Delete,
}

impl InstanceStatus {
    pub fn is_up(self) -> bool {
        !matches!(self, InstanceStatus::Abnormal | InstanceStatus::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Create => "create",
            InstanceStatus::Update => "update",
            InstanceStatus::Abnormal => "abnormal",
            InstanceStatus::Delete => "delete",
        }
    }
}

/// One collector node, as registered in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(rename = "hostID")]
    pub host_id: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    #[serde(default)]
    pub host_name: String,
    pub pub_port: u16,
    pub docker_log_port: u16,
    pub web_port: u16,
    pub status: InstanceStatus,
    #[serde(default)]
    pub tag_number: usize,
}

impl Instance {
    /// `ip:pub_port`, unique per node and used in registry keys and pins.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host_ip, self.pub_port)
    }

    pub fn pub_address(&self) -> String {
        self.key()
    }

    /// Where producers should ship this node's container logs.
    pub fn docker_log_url(&self) -> String {
        format!("tcp://{}:{}", self.host_ip, self.docker_log_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_json() {
        let instance = Instance {
            host_id: "node-1".to_string(),
            host_ip: "10.0.0.1".to_string(),
            host_name: "collector-a".to_string(),
            pub_port: 6365,
            docker_log_port: 6362,
            web_port: 6363,
            status: InstanceStatus::Create,
            tag_number: 0,
        };
        let json = serde_json::to_value(&instance).expect("encode");
        assert_eq!(json["hostID"], "node-1");
        assert_eq!(json["hostIP"], "10.0.0.1");
        assert_eq!(json["pubPort"], 6365);
        assert_eq!(json["status"], "create");

        assert_eq!(instance.key(), "10.0.0.1:6365");
        assert_eq!(instance.docker_log_url(), "tcp://10.0.0.1:6362");
    }

    #[test]
    fn test_status_liveness() {
        assert!(InstanceStatus::Update.is_up());
        assert!(!InstanceStatus::Abnormal.is_up());
        assert!(!InstanceStatus::Delete.is_up());
    }
}
