//! Deployment manifest: the desired state of the fleet — which services run
//! where, with which activation arguments, and the per-target profile paths
//! that will ultimately point at them.

use crate::errors::Error;
use crate::model::xml::Element;

/// Identifies a `ManifestService` uniquely within a manifest. The planner
/// compares manifests by this key (§4.E).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub target: String,
    pub container: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestService {
    pub key: ServiceKey,
    pub service_path: String,
    pub service_type: String,
    pub depends_on: Vec<ServiceKey>,
    pub arguments: Vec<(String, String)>,
}

impl ManifestService {
    pub fn target(&self) -> &str {
        &self.key.target
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMapping {
    pub target: String,
    pub profile: String,
    pub profile_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub services: Vec<ManifestService>,
    pub profiles: Vec<ProfileMapping>,
}

impl Manifest {
    pub fn from_xml(xml: &str) -> Result<Manifest, Error> {
        let root = crate::model::xml::parse(xml)?;

        let services_root = root
            .child("services")
            .ok_or_else(|| Error::malformed_model("manifest is missing its 'services' element"))?;

        let mut services = Vec::new();
        for service_el in services_root.children_named("service") {
            services.push(parse_service(service_el)?);
        }

        let profiles = root
            .child("profiles")
            .map(|profiles_root| {
                profiles_root
                    .children_named("profile")
                    .map(parse_profile)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Manifest { services, profiles })
    }

    pub fn find(&self, key: &ServiceKey) -> Option<&ManifestService> {
        self.services.iter().find(|service| &service.key == key)
    }
}

fn parse_service(service_el: &Element) -> Result<ManifestService, Error> {
    let name = attr(service_el, "name")?;
    let target = attr(service_el, "target")?;
    let container = attr(service_el, "container")?;
    let service_type = attr(service_el, "type")?;

    let service_path = service_el
        .child("servicePath")
        .map(|el| el.text_trimmed().to_string())
        .ok_or_else(|| Error::malformed_model(format!("service '{name}' is missing its servicePath")))?;

    let depends_on = service_el
        .child("dependsOn")
        .map(|deps_el| {
            deps_el
                .children_named("on")
                .map(|on_el| {
                    Ok(ServiceKey {
                        target: attr(on_el, "target")?,
                        container: attr(on_el, "container")?,
                        name: attr(on_el, "name")?,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()
        })
        .transpose()?
        .unwrap_or_default();

    let arguments = service_el
        .child("arguments")
        .map(|args_el| {
            args_el
                .children_named("arg")
                .map(|arg_el| Ok((attr(arg_el, "name")?, arg_el.text_trimmed().to_string())))
                .collect::<Result<Vec<_>, Error>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(ManifestService {
        key: ServiceKey { target, container, name },
        service_path,
        service_type,
        depends_on,
        arguments,
    })
}

fn parse_profile(profile_el: &Element) -> Result<ProfileMapping, Error> {
    Ok(ProfileMapping {
        target: attr(profile_el, "target")?,
        profile: attr(profile_el, "name")?,
        profile_path: profile_el
            .child("profilePath")
            .map(|el| el.text_trimmed().to_string())
            .ok_or_else(|| Error::malformed_model("profile mapping is missing its profilePath"))?,
    })
}

fn attr(element: &Element, name: &str) -> Result<String, Error> {
    element
        .attr(name)
        .map(str::to_string)
        .ok_or_else(|| Error::malformed_model(format!("<{}> is missing its '{name}' attribute", element.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest_xml() -> &'static str {
        r#"
        <manifest>
          <services>
            <service name="database" target="db1" container="postgresql" type="process">
              <servicePath>/nix/store/database</servicePath>
            </service>
            <service name="webapp" target="web1" container="process-manager" type="process">
              <servicePath>/nix/store/webapp</servicePath>
              <dependsOn>
                <on name="database" target="db1" container="postgresql"/>
              </dependsOn>
              <arguments>
                <arg name="port">8080</arg>
              </arguments>
            </service>
          </services>
          <profiles>
            <profile target="web1" name="default"><profilePath>/nix/store/profile-web1</profilePath></profile>
          </profiles>
        </manifest>
        "#
    }

    #[test]
    fn parses_services_dependencies_and_profiles() {
        let manifest = Manifest::from_xml(sample_manifest_xml()).unwrap();
        assert_eq!(manifest.services.len(), 2);
        let webapp = manifest
            .find(&ServiceKey {
                target: "web1".into(),
                container: "process-manager".into(),
                name: "webapp".into(),
            })
            .unwrap();
        assert_eq!(webapp.depends_on.len(), 1);
        assert_eq!(webapp.arguments, vec![("port".to_string(), "8080".to_string())]);
        assert_eq!(manifest.profiles.len(), 1);
    }
}
