//! Target registry (§4.B): lookup by target key plus the per-target core
//! reservation primitives the bounded iteration engine acquires against.

use crate::errors::Error;
use crate::model::{Infrastructure, Target};

pub struct TargetRegistry {
    infrastructure: Infrastructure,
    default_target_property: String,
}

impl TargetRegistry {
    pub fn new(infrastructure: Infrastructure, default_target_property: impl Into<String>) -> TargetRegistry {
        TargetRegistry {
            infrastructure,
            default_target_property: default_target_property.into(),
        }
    }

    pub fn find(&self, target_key: &str) -> Option<&Target> {
        self.infrastructure.find(target_key, &self.default_target_property)
    }

    pub fn find_interface(&self, target_key: &str) -> Option<&str> {
        self.find(target_key).map(|target| target.client_interface.as_str())
    }

    pub fn require(&self, target_key: &str) -> Result<&Target, Error> {
        self.find(target_key).ok_or_else(|| Error::unknown_target(target_key))
    }

    /// Attempts to reserve one core on the given target. `Ok(true)` if a
    /// slot was free and has now been taken, `Ok(false)` if the target is
    /// fully booked, `Err` if the target key is unknown.
    pub fn try_acquire(&mut self, target_key: &str) -> Result<bool, Error> {
        let target = self
            .infrastructure
            .find_mut(target_key, &self.default_target_property)
            .ok_or_else(|| Error::unknown_target(target_key))?;
        Ok(target.try_acquire())
    }

    pub fn release(&mut self, target_key: &str) {
        if let Some(target) = self
            .infrastructure
            .find_mut(target_key, &self.default_target_property)
        {
            target.release();
        }
    }

    /// Resets every target's reservation counter to its declared capacity.
    /// Called by the coordinator between stages.
    pub fn reset_reservations(&mut self) {
        for target in self.infrastructure.targets.iter_mut() {
            target.reset_reservation();
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.infrastructure.targets.iter()
    }

    /// Every resolvable target key mapped to its `clientInterface`
    /// executable, for callers that need to address an arbitrary target's
    /// agent without going through `find`/`require` one at a time.
    pub fn interfaces(&self) -> std::collections::HashMap<String, String> {
        self.infrastructure
            .targets
            .iter()
            .filter_map(|target| {
                target
                    .key(&self.default_target_property)
                    .map(|key| (key.to_string(), target.client_interface.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Infrastructure;

    fn registry_with_single_target(num_of_cores: u32) -> TargetRegistry {
        let xml = format!(
            r#"<infrastructure>
                <target name="web1">
                    <system>x86_64-linux</system>
                    <clientInterface>ssh-client</clientInterface>
                    <numOfCores>{num_of_cores}</numOfCores>
                    <properties><hostname>web1.example.com</hostname></properties>
                </target>
            </infrastructure>"#
        );
        let infra = Infrastructure::from_xml(&xml, "hostname").unwrap();
        TargetRegistry::new(infra, "hostname")
    }

    #[test]
    fn acquire_respects_the_per_target_cap() {
        let mut registry = registry_with_single_target(1);
        assert!(registry.try_acquire("web1.example.com").unwrap());
        assert!(!registry.try_acquire("web1.example.com").unwrap());
        registry.release("web1.example.com");
        assert!(registry.try_acquire("web1.example.com").unwrap());
    }

    #[test]
    fn unknown_target_is_an_error() {
        let mut registry = registry_with_single_target(1);
        assert!(registry.try_acquire("nowhere").is_err());
    }

    #[test]
    fn interfaces_maps_resolved_keys_to_client_interface() {
        let registry = registry_with_single_target(1);
        let interfaces = registry.interfaces();
        assert_eq!(interfaces.get("web1.example.com").map(String::as_str), Some("ssh-client"));
    }

    #[test]
    fn reset_reservations_restores_full_capacity() {
        let mut registry = registry_with_single_target(2);
        registry.try_acquire("web1.example.com").unwrap();
        registry.try_acquire("web1.example.com").unwrap();
        registry.reset_reservations();
        assert!(registry.try_acquire("web1.example.com").unwrap());
        assert!(registry.try_acquire("web1.example.com").unwrap());
    }
}
