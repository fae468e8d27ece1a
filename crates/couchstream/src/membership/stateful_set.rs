//! StatefulSet ordinal membership
//!
//! Kubernetes StatefulSet pods are named `<set>-<ordinal>`; the ordinal is
//! a stable 0-based index, so `member_number = ordinal + 1` with the group
//! size taken from configuration gives a deterministic model with no
//! coordination at all.

use super::{Membership, Model};
use crate::bus::{Bus, Event};
use crate::error::{DcpError, Result};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug)]
pub struct StatefulSetMembership {
    model: Model,
}

impl StatefulSetMembership {
    /// Resolve the ordinal from the pod hostname (`HOSTNAME` env, as the
    /// kubelet sets it)
    pub fn from_env(total_members: u16, bus: Bus) -> Result<Self> {
        let hostname = std::env::var("HOSTNAME")
            .map_err(|_| DcpError::config("HOSTNAME is not set; not running in a StatefulSet?"))?;
        Self::from_hostname(&hostname, total_members, bus)
    }

    pub fn from_hostname(hostname: &str, total_members: u16, bus: Bus) -> Result<Self> {
        let ordinal = parse_ordinal(hostname)?;
        let member_number = ordinal + 1;
        if member_number > total_members {
            return Err(DcpError::config(format!(
                "ordinal {ordinal} of {hostname} exceeds totalMembers {total_members}"
            )));
        }

        let model = Model::new(member_number, total_members);
        info!("statefulSet membership from {hostname}: {model}");
        bus.publish(Event::MembershipChanged(model));
        Ok(Self { model })
    }
}

/// The trailing dash-delimited integer of the hostname
fn parse_ordinal(hostname: &str) -> Result<u16> {
    hostname
        .rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse::<u16>().ok())
        .ok_or_else(|| {
            DcpError::config(format!("hostname {hostname} has no ordinal suffix"))
        })
}

#[async_trait]
impl Membership for StatefulSetMembership {
    async fn get_info(&self) -> Result<Model> {
        Ok(self.model)
    }

    async fn close(&self) {}

    fn type_name(&self) -> &'static str {
        "kubernetesStatefulSet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ordinal() {
        assert_eq!(parse_ordinal("indexer-0").unwrap(), 0);
        assert_eq!(parse_ordinal("order-indexer-12").unwrap(), 12);
        assert!(parse_ordinal("indexer").is_err());
        assert!(parse_ordinal("indexer-abc").is_err());
    }

    #[tokio::test]
    async fn test_model_from_hostname() {
        let membership =
            StatefulSetMembership::from_hostname("indexer-2", 4, Bus::new()).unwrap();
        assert_eq!(membership.get_info().await.unwrap(), Model::new(3, 4));
    }

    #[test]
    fn test_ordinal_beyond_total_is_rejected() {
        let err = StatefulSetMembership::from_hostname("indexer-5", 3, Bus::new()).unwrap_err();
        assert!(err.to_string().contains("exceeds totalMembers"));
    }
}
