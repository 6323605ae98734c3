use serde::{Deserialize, Serialize};
use std::fmt;

/// Static description of one cellular operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorProfile {
    pub name: String,
    /// MCC+MNC used for the manual `+COPS` lock
    pub plmn: String,
    #[serde(default = "default_apn")]
    pub apn: String,
    /// Preferred-mode command, e.g. `AT+CNMP=38` (LTE only)
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// CAT-M / NB-IoT selection command
    #[serde(default = "default_cat_mode")]
    pub cat_mode: String,
    /// Band list for `AT+CBANDCFG="CAT-M",...`
    #[serde(default = "default_bands")]
    pub bands: String,
}

impl fmt::Display for OperatorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.plmn)
    }
}

fn default_apn() -> String {
    "em".to_string()
}

fn default_network_mode() -> String {
    "AT+CNMP=38".to_string()
}

fn default_cat_mode() -> String {
    "AT+CMNB=1".to_string()
}

fn default_bands() -> String {
    "1,2,3,4,5,8,12,13,18,19,20,26,28".to_string()
}

impl OperatorProfile {
    pub fn new(name: &str, plmn: &str) -> Self {
        Self {
            name: name.to_string(),
            plmn: plmn.to_string(),
            apn: default_apn(),
            network_mode: default_network_mode(),
            cat_mode: default_cat_mode(),
            bands: default_bands(),
        }
    }
}

/// Built-in table for Mexican LTE-M coverage
pub fn default_profiles() -> Vec<OperatorProfile> {
    vec![
        OperatorProfile::new("TELCEL", "334020"),
        OperatorProfile::new("AT&T MEXICO", "334090"),
        OperatorProfile::new("AT&T MEXICO", "334050"),
        OperatorProfile::new("MOVISTAR", "334030"),
        OperatorProfile::new("ALTAN", "334140"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults_from_toml() {
        let profile: OperatorProfile = toml::from_str("name = \"X\"\nplmn = \"00101\"\n").unwrap();
        assert_eq!(profile, OperatorProfile::new("X", "00101"));
        assert_eq!(profile.to_string(), "X (00101)");
    }

    #[test]
    fn test_default_table() {
        let table = default_profiles();
        assert_eq!(table.len(), 5);
        assert_eq!(table[0].plmn, "334020");
        assert!(table.iter().all(|p| p.apn == "em"));
    }
}
