//! Typed node configuration.
//!
//! The configuration is a YAML document loaded once at startup and validated before anything
//! else runs. Every section has defaults matching the reference deployment, so an empty file (or
//! no file at all) yields a working three-threshold, single-profile setup.

use std::{
    collections::BTreeMap,
    fmt, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{
    de::{self, Deserializer, MapAccess, Visitor},
    Deserialize, Serialize,
};

use crate::{
    geometry::Position,
    quality::{CurveError, DistanceCurve, DistanceThreshold, EnvironmentProfile},
    topology::TopologyMode,
    NodeId,
};

/// Name of the profile used when nothing else is configured.
pub const DEFAULT_ENVIRONMENT: &str = "clear";

/// Errors raised while loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid distance curve: {0}")]
    Curve(#[from] CurveError),
    #[error("radio bandwidth must be positive")]
    ZeroBandwidth,
    #[error("environment profile {0:?} has a non-positive or non-finite multiplier, or leaves no bandwidth")]
    InvalidProfile(String),
    #[error("default environment {0:?} is not a configured profile")]
    UnknownDefaultEnvironment(String),
    #[error("position of node {0} is not finite")]
    InvalidPosition(NodeId),
    #[error("{0} must be positive")]
    ZeroInterval(&'static str),
}

/// The complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radio hardware parameters.
    pub radio: RadioConfig,
    /// Distance degradation curve.
    pub distance: DistanceConfig,
    /// Environment profiles.
    pub environment: EnvironmentConfig,
    /// Topology defaults.
    pub topology: TopologyConfig,
    /// Initial state.
    pub defaults: DefaultsConfig,
    /// Addressing of nodes on the simulated network.
    pub network: NetworkConfig,
    /// Connectivity prober settings.
    pub probe: ProbeConfig,
    /// Traffic counter sampling settings.
    pub traffic: TrafficConfig,
}

/// Radio hardware parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Total bandwidth shared by every link of a node, before environment scaling.
    pub bandwidth_kbps: u64,
    /// The hub.
    pub base_station: BaseStationConfig,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self { bandwidth_kbps: 1_000, base_station: BaseStationConfig::default() }
    }
}

/// Hub settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseStationConfig {
    /// Where the hub sits.
    pub position: Position,
}

/// Distance degradation curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    /// Distance at and beyond which links are unreachable.
    pub max_range_m: f64,
    /// Breakpoints, ordered by range.
    pub thresholds: Vec<DistanceThreshold>,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            max_range_m: 1_000.0,
            thresholds: vec![
                DistanceThreshold::new(0.0, 2.0, 0.0),
                DistanceThreshold::new(500.0, 30.0, 10.0),
                DistanceThreshold::new(1_000.0, 100.0, 40.0),
            ],
        }
    }
}

/// Environment profiles, by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// All selectable profiles.
    pub profiles: BTreeMap<String, EnvironmentProfile>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self { profiles: BTreeMap::from([(DEFAULT_ENVIRONMENT.to_string(), EnvironmentProfile::CLEAR)]) }
    }
}

/// Topology defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Mode at startup.
    pub default: TopologyMode,
}

/// Initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Environment profile at startup.
    pub environment: String,
    /// Initial participant positions. Nodes not listed start at the origin.
    #[serde(deserialize_with = "deserialize_node_map")]
    pub positions: BTreeMap<NodeId, Position>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self { environment: DEFAULT_ENVIRONMENT.to_string(), positions: BTreeMap::new() }
    }
}

/// Addressing of nodes on the simulated network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network address of the simulated subnet.
    pub subnet_base: Ipv4Addr,
    /// Added to the node id to get the host part of its address.
    pub host_offset: u32,
    /// Egress interface shaped by the node.
    pub interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { subnet_base: Ipv4Addr::new(172, 31, 0, 0), host_offset: 10, interface: "eth0".into() }
    }
}

impl NetworkConfig {
    /// Address of node `id`: hub at `.10`, node 1 at `.11` and so on.
    pub fn address_of(&self, id: NodeId) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet_base).wrapping_add(self.host_offset).wrapping_add(id))
    }
}

/// Connectivity prober settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Seconds between probe cycles.
    pub interval_secs: u64,
    /// Per-check timeout in milliseconds.
    pub timeout_ms: u64,
    /// Port of the stream (TCP) probe listener.
    pub stream_port: u16,
    /// Port of the datagram (UDP) probe listener.
    pub datagram_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { interval_secs: 2, timeout_ms: 2_000, stream_port: 9_000, datagram_port: 9_001 }
    }
}

impl ProbeConfig {
    /// Time between probe cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Bound applied to every single check.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Traffic counter sampling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Seconds between counter samples.
    pub interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self { interval_secs: 2 }
    }
}

impl TrafficConfig {
    /// Time between counter samples.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load the configuration from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };

        let config = Self::from_yaml(&contents)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to `null`, which should mean "all defaults".
        let config: Self = if yaml.trim().is_empty() { Self::default() } else { serde_yaml::from_str(yaml)? };
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant that later stages rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.curve()?;

        if self.radio.bandwidth_kbps == 0 {
            return Err(ConfigError::ZeroBandwidth);
        }
        let base_kbps = self.radio.bandwidth_kbps;
        if let Some((name, _)) =
            self.environment.profiles.iter().find(|(_, p)| !p.is_valid() || p.bandwidth_kbps(base_kbps) == 0)
        {
            return Err(ConfigError::InvalidProfile(name.clone()));
        }
        if self.profile(&self.defaults.environment).is_none() {
            return Err(ConfigError::UnknownDefaultEnvironment(self.defaults.environment.clone()));
        }
        if let Some((id, _)) = self.defaults.positions.iter().find(|(_, p)| !p.is_finite()) {
            return Err(ConfigError::InvalidPosition(*id));
        }
        if !self.radio.base_station.position.is_finite() {
            return Err(ConfigError::InvalidPosition(crate::HUB_ID));
        }
        if self.probe.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("probe.interval_secs"));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("probe.timeout_ms"));
        }
        if self.traffic.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("traffic.interval_secs"));
        }

        Ok(())
    }

    /// Build the distance degradation curve.
    pub fn curve(&self) -> Result<DistanceCurve, CurveError> {
        DistanceCurve::new(self.distance.thresholds.clone(), self.distance.max_range_m)
    }

    /// Look up an environment profile by name.
    pub fn profile(&self, name: &str) -> Option<&EnvironmentProfile> {
        self.environment.profiles.get(name)
    }

    /// Initial position of node `id`.
    pub fn initial_position(&self, id: NodeId) -> Position {
        if id == crate::HUB_ID {
            return self.radio.base_station.position;
        }
        self.defaults.positions.get(&id).copied().unwrap_or(Position::ORIGIN)
    }
}

/// Node ids appear as YAML keys, written either as integers (`1:`) or strings (`"1":`).
fn deserialize_node_map<'de, D>(deserializer: D) -> Result<BTreeMap<NodeId, Position>, D::Error>
where
    D: Deserializer<'de>,
{
    struct NodeKey(NodeId);

    impl<'de> Deserialize<'de> for NodeKey {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct KeyVisitor;

            impl Visitor<'_> for KeyVisitor {
                type Value = NodeKey;

                fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str("a node id")
                }

                fn visit_u64<E: de::Error>(self, v: u64) -> Result<NodeKey, E> {
                    NodeId::try_from(v).map(NodeKey).map_err(|_| E::custom("node id out of range"))
                }

                fn visit_i64<E: de::Error>(self, v: i64) -> Result<NodeKey, E> {
                    NodeId::try_from(v).map(NodeKey).map_err(|_| E::custom("node id out of range"))
                }

                fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeKey, E> {
                    v.trim().parse().map(NodeKey).map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }

            deserializer.deserialize_any(KeyVisitor)
        }
    }

    struct MapVisitor;

    impl<'de> Visitor<'de> for MapVisitor {
        type Value = BTreeMap<NodeId, Position>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of node ids to positions")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = BTreeMap::new();
            while let Some((NodeKey(id), position)) = access.next_entry::<NodeKey, Position>()? {
                map.insert(id, position);
            }
            Ok(map)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(BTreeMap::new())
        }
    }

    deserializer.deserialize_any(MapVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
radio:
  bandwidth_kbps: 2000
  base_station:
    position: { x: 10, y: 20, z: 0 }
distance:
  max_range_m: 800
  thresholds:
    - { range_m: 0, latency_ms: 1, loss_percent: 0 }
    - { range_m: 400, latency_ms: 20, loss_percent: 5 }
environment:
  profiles:
    clear: {}
    storm: { latency_multiplier: 2.0, loss_multiplier: 1.5, bandwidth_multiplier: 0.5 }
topology:
  default: star
defaults:
  environment: storm
  positions:
    1: { x: 100, y: 0, z: 50 }
    "2": { x: 200 }
"#;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.radio.bandwidth_kbps, 1_000);
        assert_eq!(config.distance.thresholds.len(), 3);
        assert_eq!(config.topology.default, TopologyMode::Mesh);
        assert_eq!(config.defaults.environment, "clear");
        assert_eq!(config.network.address_of(0), Ipv4Addr::new(172, 31, 0, 10));
        assert_eq!(config.network.address_of(3), Ipv4Addr::new(172, 31, 0, 13));
        assert_eq!(config.probe.stream_port, 9_000);
        assert_eq!(config.probe.datagram_port, 9_001);
    }

    #[test]
    fn parse_full_document() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.radio.bandwidth_kbps, 2_000);
        assert_eq!(config.topology.default, TopologyMode::Star);
        assert_eq!(config.profile("clear"), Some(&EnvironmentProfile::CLEAR));
        assert_eq!(config.profile("storm").unwrap().bandwidth_multiplier, 0.5);
        assert_eq!(config.initial_position(0), Position::new(10.0, 20.0, 0.0));
        assert_eq!(config.initial_position(1), Position::new(100.0, 0.0, 50.0));
        assert_eq!(config.initial_position(2), Position::new(200.0, 0.0, 0.0));
        assert_eq!(config.initial_position(3), Position::ORIGIN);
        // Sections that were left out keep their defaults.
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn missing_file_is_default() {
        let config = Config::load("/nonexistent/manet/config.yaml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rejects_unknown_default_environment() {
        let yaml = "defaults:\n  environment: fog\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::UnknownDefaultEnvironment(name)) if name == "fog"
        ));
    }

    #[test]
    fn rejects_decreasing_thresholds() {
        let yaml = r#"
distance:
  thresholds:
    - { range_m: 500, latency_ms: 30, loss_percent: 10 }
    - { range_m: 100, latency_ms: 5, loss_percent: 1 }
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Curve(CurveError::Decreasing { .. }))));
    }

    #[test]
    fn rejects_invalid_profiles_and_bandwidth() {
        let yaml = "environment:\n  profiles:\n    clear: { bandwidth_multiplier: 0 }\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::InvalidProfile(_))));

        let yaml = "radio:\n  bandwidth_kbps: 0\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::ZeroBandwidth)));
    }

    #[test]
    fn rejects_profiles_that_floor_bandwidth_to_zero() {
        let yaml = "environment:\n  profiles:\n    clear: {}\n    jammed: { bandwidth_multiplier: 0.0005 }\n";
        match Config::from_yaml(yaml) {
            Err(ConfigError::InvalidProfile(name)) => assert_eq!(name, "jammed"),
            other => panic!("unexpected result: {other:?}"),
        }

        // The same multiplier still leaves some bandwidth on a faster radio.
        let yaml = "radio:\n  bandwidth_kbps: 4000\nenvironment:\n  profiles:\n    clear: {}\n    jammed: { bandwidth_multiplier: 0.0005 }\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.profile("jammed").unwrap().bandwidth_kbps(4_000) >= 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(Config::from_yaml("radio: [1, 2"), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn serializes_to_json() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["topology"]["default"], "star");
        assert_eq!(json["defaults"]["positions"]["1"]["z"], 50.0);
    }
}
