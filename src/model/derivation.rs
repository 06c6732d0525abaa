//! Distributed-derivation model: which build recipe goes on which target.
//!
//! Grounded on `libdistderivation/derivationmapping.c`'s
//! `create_derivation_array`: a mapping missing either mandatory field
//! discards the *entire* array rather than just that one mapping.

use crate::errors::Error;
use crate::model::xml::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationItem {
    pub derivation: String,
    pub target: String,
    /// Store paths produced by `realise`. Empty until the build succeeds;
    /// written exactly once by the iteration engine's completion handler.
    pub result: Vec<String>,
}

impl DerivationItem {
    pub fn has_succeeded(&self) -> bool {
        !self.result.is_empty()
    }
}

pub fn derivations_from_xml(xml: &str) -> Result<Vec<DerivationItem>, Error> {
    let root = crate::model::xml::parse(xml)?;
    let mappings = root.find_all(&["build", "mapping"]);

    let mut items = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        match parse_mapping(mapping) {
            Some(item) => items.push(item),
            None => {
                return Err(Error::malformed_model(
                    "a mandatory property seems to be missing in the distributed derivation document",
                ));
            }
        }
    }
    Ok(items)
}

fn parse_mapping(mapping: &Element) -> Option<DerivationItem> {
    let derivation = mapping.child("derivation")?.text_trimmed().to_string();
    let target = mapping.child("target")?.text_trimmed().to_string();
    Some(DerivationItem {
        derivation,
        target,
        result: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_mapping() {
        let xml = r#"
        <distributedderivation>
          <build>
            <mapping><derivation>/nix/store/a.drv</derivation><target>web1</target></mapping>
            <mapping><derivation>/nix/store/b.drv</derivation><target>web2</target></mapping>
          </build>
        </distributedderivation>
        "#;
        let items = derivations_from_xml(xml).unwrap();
        assert_eq!(items.len(), 2);
        assert!(!items[0].has_succeeded());
    }

    #[test]
    fn missing_mandatory_field_discards_the_whole_array() {
        let xml = r#"
        <distributedderivation>
          <build>
            <mapping><derivation>/nix/store/a.drv</derivation><target>web1</target></mapping>
            <mapping><derivation>/nix/store/b.drv</derivation></mapping>
          </build>
        </distributedderivation>
        "#;
        assert!(derivations_from_xml(xml).is_err());
    }
}
