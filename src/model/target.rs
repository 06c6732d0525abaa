//! Infrastructure model: targets and the containers hosted on them.
//!
//! Grounded on `libinfrastructure/infrastructure.c`: property and container
//! maps are kept sorted by name (the original used this for binary search;
//! here it is mostly useful for deterministic iteration and equality), and
//! target-key resolution falls back from a target's own `targetProperty` to
//! a caller-supplied default property name.

use crate::errors::Error;
use crate::model::xml::Element;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub system: String,
    pub client_interface: String,
    pub target_property: Option<String>,
    pub num_of_cores: u32,
    pub available_cores: u32,
    pub properties: BTreeMap<String, String>,
    pub containers: BTreeMap<String, Container>,
}

impl Target {
    /// The address used to reach this target's agent: the value of
    /// `properties[target_property]`, falling back to
    /// `properties[default_target_property]` when this target doesn't name
    /// its own property.
    pub fn key(&self, default_target_property: &str) -> Option<&str> {
        let property_name = self.target_property.as_deref().unwrap_or(default_target_property);
        self.properties.get(property_name).map(String::as_str)
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.available_cores > 0 {
            self.available_cores -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) {
        if self.available_cores < self.num_of_cores {
            self.available_cores += 1;
        }
    }

    /// Resets the per-target reservation counter to its declared capacity.
    /// Called by the coordinator between stages (see the Open Question
    /// resolution in DESIGN.md: reservations do not carry across stages).
    pub fn reset_reservation(&mut self) {
        self.available_cores = self.num_of_cores;
    }
}

pub struct Infrastructure {
    pub targets: Vec<Target>,
}

impl Infrastructure {
    pub fn from_xml(xml: &str, default_target_property: &str) -> Result<Infrastructure, Error> {
        let root = crate::model::xml::parse(xml)?;
        Self::from_element(&root, default_target_property)
    }

    fn from_element(root: &Element, default_target_property: &str) -> Result<Infrastructure, Error> {
        let mut targets = Vec::new();
        let mut seen_keys: Vec<String> = Vec::new();

        for target_el in root.children_named("target") {
            let target = parse_target(target_el)?;

            if let Some(key) = target.key(default_target_property) {
                if seen_keys.iter().any(|seen| seen == key) {
                    return Err(Error::malformed_model(format!(
                        "two targets resolve to the same target key '{key}'"
                    )));
                }
                seen_keys.push(key.to_string());
            } else {
                return Err(Error::malformed_model(format!(
                    "target '{}' has no value for its target property",
                    target.name
                )));
            }

            targets.push(target);
        }

        Ok(Infrastructure { targets })
    }

    pub fn find(&self, target_key: &str, default_target_property: &str) -> Option<&Target> {
        self.targets
            .iter()
            .find(|target| target.key(default_target_property) == Some(target_key))
    }

    pub fn find_mut(&mut self, target_key: &str, default_target_property: &str) -> Option<&mut Target> {
        self.targets
            .iter_mut()
            .find(|target| target.key(default_target_property) == Some(target_key))
    }
}

fn parse_target(target_el: &Element) -> Result<Target, Error> {
    let name = target_el
        .attr("name")
        .ok_or_else(|| Error::malformed_model("target element is missing its 'name' attribute"))?
        .to_string();

    let system = required_text(target_el, "system", &name)?;
    let client_interface = required_text(target_el, "clientInterface", &name)?;
    let target_property = target_el.child("targetProperty").map(|el| el.text_trimmed().to_string());

    let num_of_cores: u32 = target_el
        .child("numOfCores")
        .map(|el| el.text_trimmed())
        .unwrap_or("1")
        .parse()
        .map_err(|_| Error::malformed_model(format!("target '{name}' has a non-numeric numOfCores")))?;

    let properties = target_el
        .child("properties")
        .map(parse_property_map)
        .unwrap_or_default();

    let containers = target_el
        .child("containers")
        .map(|containers_el| {
            containers_el
                .children
                .iter()
                .map(|container_el| {
                    (
                        container_el.name.clone(),
                        Container {
                            name: container_el.name.clone(),
                            properties: parse_property_map(container_el),
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Target {
        name,
        system,
        client_interface,
        target_property,
        num_of_cores,
        available_cores: num_of_cores,
        properties,
        containers,
    })
}

fn parse_property_map(container: &Element) -> BTreeMap<String, String> {
    container
        .children
        .iter()
        .map(|el| (el.name.clone(), el.text_trimmed().to_string()))
        .collect()
}

fn required_text(target_el: &Element, field: &str, target_name: &str) -> Result<String, Error> {
    target_el
        .child(field)
        .map(|el| el.text_trimmed().to_string())
        .ok_or_else(|| Error::malformed_model(format!("target '{target_name}' is missing '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_infrastructure_xml() -> &'static str {
        r#"
        <infrastructure>
          <target name="web1">
            <system>x86_64-linux</system>
            <clientInterface>ssh-client</clientInterface>
            <targetProperty>hostname</targetProperty>
            <numOfCores>2</numOfCores>
            <properties>
              <hostname>web1.example.com</hostname>
            </properties>
            <containers>
              <process-manager>
                <port>8080</port>
              </process-manager>
            </containers>
          </target>
          <target name="web2">
            <system>x86_64-linux</system>
            <clientInterface>ssh-client</clientInterface>
            <numOfCores>1</numOfCores>
            <properties>
              <hostname>web2.example.com</hostname>
            </properties>
          </target>
        </infrastructure>
        "#
    }

    #[test]
    fn loads_targets_and_resolves_keys_with_fallback() {
        let infra = Infrastructure::from_xml(sample_infrastructure_xml(), "hostname").unwrap();
        assert_eq!(infra.targets.len(), 2);

        let web1 = infra.find("web1.example.com", "hostname").unwrap();
        assert_eq!(web1.name, "web1");
        assert_eq!(web1.available_cores, 2);
        assert!(web1.containers.contains_key("process-manager"));

        // web2 has no targetProperty of its own, falls back to the default.
        let web2 = infra.find("web2.example.com", "hostname").unwrap();
        assert_eq!(web2.name, "web2");
    }

    #[test]
    fn rejects_duplicate_target_keys() {
        let xml = r#"
        <infrastructure>
          <target name="a">
            <system>x86_64-linux</system>
            <clientInterface>ssh-client</clientInterface>
            <numOfCores>1</numOfCores>
            <properties><hostname>dup.example.com</hostname></properties>
          </target>
          <target name="b">
            <system>x86_64-linux</system>
            <clientInterface>ssh-client</clientInterface>
            <numOfCores>1</numOfCores>
            <properties><hostname>dup.example.com</hostname></properties>
          </target>
        </infrastructure>
        "#;
        let err = Infrastructure::from_xml(xml, "hostname").unwrap_err();
        assert!(err.to_string().contains("same target key"));
    }

    #[test]
    fn reservation_acquire_release_round_trips() {
        let mut target = Target {
            name: "t".into(),
            system: "x86_64-linux".into(),
            client_interface: "ssh-client".into(),
            target_property: None,
            num_of_cores: 1,
            available_cores: 1,
            properties: BTreeMap::new(),
            containers: BTreeMap::new(),
        };

        assert!(target.try_acquire());
        assert!(!target.try_acquire());
        target.release();
        assert!(target.try_acquire());

        target.reset_reservation();
        assert_eq!(target.available_cores, 1);
    }
}
