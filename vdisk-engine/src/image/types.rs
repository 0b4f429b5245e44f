//! Virtual image type definitions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceConfig;

/// Image implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// qemu-img style images with backing chains
    #[default]
    Qemu,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Qemu => "qemu",
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(ImageType::Qemu),
            other => Err(format!("Unknown image type: {}", other)),
        }
    }
}

/// Arrangement of the layers of a virtual image.
///
/// Serialized as `{"none": [name]}` or `{"chain": [base, ..., top]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// A single layer
    None(Vec<String>),
    /// Ordered backing chain, base first
    Chain(Vec<String>),
}

impl Topology {
    /// The topology for `names`: one name is `none`, more is a chain.
    pub fn from_names(names: Vec<String>) -> Self {
        if names.len() > 1 {
            Topology::Chain(names)
        } else {
            Topology::None(names)
        }
    }

    pub fn names(&self) -> &[String] {
        match self {
            Topology::None(names) | Topology::Chain(names) => names,
        }
    }

    pub fn is_chain(&self) -> bool {
        matches!(self, Topology::Chain(_))
    }

    /// The layer a VM writes to.
    pub fn top(&self) -> Option<&str> {
        self.names().last().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    /// Topology with `name` appended as the new top.
    pub fn pushed(&self, name: &str) -> Self {
        let mut names = self.names().to_vec();
        names.push(name.to_string());
        Self::from_names(names)
    }

    /// Topology without its top.
    pub fn popped(&self) -> Self {
        let mut names = self.names().to_vec();
        names.pop();
        Self::from_names(names)
    }
}

/// Storage format of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerFormat {
    Raw,
    #[default]
    Qcow2,
    Luks,
}

impl std::str::FromStr for LayerFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(LayerFormat::Raw),
            "qcow2" => Ok(LayerFormat::Qcow2),
            "luks" => Ok(LayerFormat::Luks),
            other => Err(format!("Unknown image format: {}", other)),
        }
    }
}

/// Layer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMeta {
    pub uuid: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
}

/// Layer specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub format: LayerFormat,
    /// Name of the layer this one is backed by
    #[serde(default)]
    pub backing: Option<String>,
    /// Name of the layer holding this layer's backup
    #[serde(default)]
    pub backup: Option<String>,
    /// Volume resource ID, once the layer object exists
    #[serde(default)]
    pub volume: Option<String>,
    /// Volume definition, until the layer object exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_config: Option<ResourceConfig>,
    /// qcow2 cluster size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<String>,
    /// qcow2 preallocation mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<String>,
    /// luks secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// One lower-level image of a virtual image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub meta: LayerMeta,
    pub spec: LayerSpec,
}

/// Virtual image metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub uuid: Option<String>,
    /// Always the top of the topology
    pub name: String,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    /// VM using the image
    #[serde(default)]
    pub owner: Option<String>,
    pub topology: Topology,
}

/// Virtual image specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Layer name -> layer, in definition order
    pub images: IndexMap<String, LayerConfig>,
}

/// Virtual image configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub meta: ImageMeta,
    pub spec: ImageSpec,
}

impl ImageConfig {
    /// Image ID, empty until the image object exists.
    pub fn id(&self) -> &str {
        self.meta.uuid.as_deref().unwrap_or_default()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.spec.images.get(name)
    }

    /// Volume resource IDs of every layer object.
    pub fn volumes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.spec
            .images
            .iter()
            .filter_map(|(name, layer)| layer.spec.volume.as_deref().map(|v| (name.as_str(), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topology_follows_layer_count() {
        let t = Topology::from_names(vec!["base".into()]);
        assert_eq!(serde_json::to_value(&t).unwrap(), json!({"none": ["base"]}));

        let t = t.pushed("sn");
        assert_eq!(serde_json::to_value(&t).unwrap(), json!({"chain": ["base", "sn"]}));
        assert_eq!(t.top(), Some("sn"));

        let t = t.popped();
        assert!(!t.is_chain());
        assert_eq!(t.names(), ["base".to_string()]);
    }

    #[test]
    fn test_layer_format_tags() {
        assert_eq!("raw".parse::<LayerFormat>().unwrap(), LayerFormat::Raw);
        assert!("vmdk".parse::<LayerFormat>().is_err());
    }
}
