//! Fixed membership from configuration

use super::{Membership, Model};
use crate::bus::{Bus, Event};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Emits the configured model once; never changes afterwards
pub struct StaticMembership {
    model: Model,
}

impl StaticMembership {
    pub fn new(model: Model, bus: Bus) -> Self {
        info!("static membership: {model}");
        bus.publish(Event::MembershipChanged(model));
        Self { model }
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn get_info(&self) -> Result<Model> {
        Ok(self.model)
    }

    async fn close(&self) {}

    fn type_name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_emits_configured_model_once() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            if let Event::MembershipChanged(model) = event {
                seen_clone.lock().push(*model);
            }
        });

        let membership = StaticMembership::new(Model::new(2, 3), bus);
        assert_eq!(membership.get_info().await.unwrap(), Model::new(2, 3));
        assert_eq!(*seen.lock(), vec![Model::new(2, 3)]);
    }
}
