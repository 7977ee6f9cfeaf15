/**
 * REGISTER CATALOG - Métadonnées des registres RW TinyBMS
 *
 * RÔLE : Table statique en lecture seule (adresse → descripteur). Sert à
 * valider chaque demande d'écriture avant qu'elle n'atteigne le lien série :
 * une valeur hors bornes est rejetée avec une raison lisible, jamais transmise.
 */

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("../data/registers.json");
const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnumOption {
    pub value: i64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterDescriptor {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub group: String,
    #[serde(rename = "type", default)]
    pub value_type: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<EnumOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn unit_scale() -> f64 {
    1.0
}

impl RegisterDescriptor {
    pub fn to_user(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogFile {
    tiny_rw_registers: BTreeMap<String, RegisterDescriptor>,
}

/// Écriture validée, prête pour la file du lien série
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterWrite {
    pub address: u16,
    pub key: String,
    pub raw: i64,
    pub user_value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterCatalog {
    registers: BTreeMap<u16, RegisterDescriptor>,
}

impl RegisterCatalog {
    pub fn from_json(txt: &str) -> Result<Self, BridgeError> {
        let file: CatalogFile = serde_json::from_str(txt)?;
        let mut registers = BTreeMap::new();
        for (addr, desc) in file.tiny_rw_registers {
            let address: u16 = addr
                .trim()
                .parse()
                .map_err(|_| BridgeError::Decode(format!("invalid register address '{addr}'")))?;
            registers.insert(address, desc);
        }
        Ok(Self { registers })
    }

    /// Catalogue embarqué dans le binaire
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_CATALOG).unwrap_or_default()
    }

    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let txt = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&txt)
    }

    pub fn get(&self, address: u16) -> Option<&RegisterDescriptor> {
        self.registers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Vue JSON au format du fichier source (adresse en chaîne)
    pub fn to_json(&self) -> serde_json::Value {
        let map: BTreeMap<String, &RegisterDescriptor> =
            self.registers.iter().map(|(a, d)| (a.to_string(), d)).collect();
        serde_json::json!({ "tiny_rw_registers": map })
    }

    /// Liste toutes les incohérences du catalogue (vide = catalogue sain)
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut keys = HashSet::new();

        for (addr, d) in &self.registers {
            if d.key.trim().is_empty() {
                issues.push(format!("register {addr}: missing key"));
            } else if !keys.insert(d.key.as_str()) {
                issues.push(format!("register {addr}: duplicate key '{}'", d.key));
            }
            if d.label.trim().is_empty() {
                issues.push(format!("register {addr}: missing label"));
            }
            if d.scale == 0.0 {
                issues.push(format!("register {addr}: scale is zero"));
            }
            if let (Some(min), Some(max)) = (d.min, d.max) {
                if min > max {
                    issues.push(format!("register {addr}: min {min} > max {max}"));
                }
                if d.to_user(min) > d.to_user(max) + EPSILON {
                    issues.push(format!("register {addr}: user min above user max"));
                }
                if let Some(def) = d.default {
                    if def < min - EPSILON || def > max + EPSILON {
                        issues.push(format!("register {addr}: default {def} outside [{min}, {max}]"));
                    }
                }
            }
            if d.value_type == "enum" && d.options.is_empty() {
                issues.push(format!("register {addr}: enum without options"));
            }
            if d.options.iter().any(|o| o.label.trim().is_empty()) {
                issues.push(format!("register {addr}: enum option without label"));
            }
        }
        issues
    }

    /// Convertit une valeur utilisateur en brut et vérifie enum + bornes
    pub fn validate_write(&self, address: u16, user_value: f64) -> Result<RegisterWrite, BridgeError> {
        let d = self.get(address).ok_or(BridgeError::UnknownRegister(address))?;
        let violation = |reason: String| BridgeError::RegisterBoundsViolation {
            address,
            key: d.key.clone(),
            reason,
        };

        if !user_value.is_finite() {
            return Err(violation(format!("value {user_value} is not a finite number")));
        }
        if d.scale == 0.0 {
            return Err(violation("register has a zero scale".into()));
        }

        let raw = ((user_value - d.offset) / d.scale).round();

        if !d.options.is_empty() && !d.options.iter().any(|o| o.value as f64 == raw) {
            let allowed: Vec<String> = d.options.iter().map(|o| o.value.to_string()).collect();
            return Err(violation(format!("{raw} is not one of [{}]", allowed.join(", "))));
        }
        if let Some(min) = d.min {
            if raw < min {
                return Err(violation(format!(
                    "{user_value} {} below minimum {} {}",
                    d.unit,
                    d.to_user(min),
                    d.unit
                )));
            }
        }
        if let Some(max) = d.max {
            if raw > max {
                return Err(violation(format!(
                    "{user_value} {} above maximum {} {}",
                    d.unit,
                    d.to_user(max),
                    d.unit
                )));
            }
        }

        Ok(RegisterWrite {
            address,
            key: d.key.clone(),
            raw: raw as i64,
            user_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_consistent() {
        let catalog = RegisterCatalog::builtin();
        assert!(!catalog.is_empty());
        assert!(catalog.validate().is_empty(), "{:?}", catalog.validate());

        let broadcast = catalog.get(342).unwrap();
        assert_eq!(broadcast.group, "system");
        assert_eq!(broadcast.value_type, "enum");
        assert!(broadcast.options.len() >= 2);

        let cutoff = catalog.get(320).unwrap();
        assert_eq!(cutoff.group, "safety");
        assert!(cutoff.min.unwrap() <= cutoff.max.unwrap());
    }

    #[test]
    fn test_validate_reports_breaches() {
        let txt = r#"{"tiny_rw_registers": {
            "1": {"key": "a", "label": "A", "min": 10, "max": 5},
            "2": {"key": "a", "label": "B", "min": 0, "max": 5, "default": 9}
        }}"#;
        let issues = RegisterCatalog::from_json(txt).unwrap().validate();
        assert!(issues.iter().any(|i| i.contains("min 10 > max 5")));
        assert!(issues.iter().any(|i| i.contains("duplicate key")));
        assert!(issues.iter().any(|i| i.contains("default 9")));
    }

    #[test]
    fn test_write_converts_scale() {
        let catalog = RegisterCatalog::builtin();
        let w = catalog.validate_write(306, 31.4).unwrap();
        assert_eq!(w.raw, 3140);
        assert_eq!(w.key, "battery_capacity");
    }

    #[test]
    fn test_write_out_of_range_is_rejected() {
        let catalog = RegisterCatalog::builtin();
        let err = catalog.validate_write(300, 5000.0).unwrap_err();
        match err {
            BridgeError::RegisterBoundsViolation { address, reason, .. } => {
                assert_eq!(address, 300);
                assert!(reason.contains("above maximum"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(catalog.validate_write(320, -1.0).is_err());
        assert!(catalog.validate_write(300, f64::NAN).is_err());
    }

    #[test]
    fn test_enum_and_unknown() {
        let catalog = RegisterCatalog::builtin();
        assert!(catalog.validate_write(307, 3.0).is_err());
        assert_eq!(catalog.validate_write(307, 14.0).unwrap().raw, 14);
        assert!(matches!(catalog.validate_write(999, 1.0), Err(BridgeError::UnknownRegister(999))));
    }
}
