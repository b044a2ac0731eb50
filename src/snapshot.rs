//! XML documents holding categories, counters and instance values.
//!
//! ```xml
//! <snapshot>
//!   <category id="1" name="Connections" help="" detail="100" default-counter="0"
//!             instanceless="false" struct-size="8" max-name-length="64">
//!     <counter id="1" name="Bytes" help="" detail="100" type="65792" max-size="0"
//!              offset="0" default-scale="0"/>
//!     <instance id="0" name="eth0">AAAAAAAAAAA=</instance>
//!   </category>
//! </snapshot>
//! ```
//!
//! Counter data is base64 encoded. The `name` attribute of an instance is
//! omitted for unnamed instances.

use crate::{
    directory::InstanceInfo,
    error::{RepositoryError, Result},
    schema::{CategoryDefinition, CounterDefinition, CounterType, SchemaRegistry},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "snapshot")]
struct XmlSnapshot {
    #[serde(rename = "category", default)]
    categories: Vec<XmlCategory>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlCategory {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@help")]
    help: String,
    #[serde(rename = "@detail")]
    detail: u32,
    #[serde(rename = "@default-counter")]
    default_counter: i32,
    #[serde(rename = "@instanceless")]
    instanceless: bool,
    #[serde(rename = "@struct-size")]
    struct_size: u32,
    #[serde(rename = "@max-name-length")]
    max_name_len: u32,
    #[serde(rename = "counter", default)]
    counters: Vec<XmlCounter>,
    #[serde(rename = "instance", default)]
    instances: Vec<XmlInstance>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlCounter {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@help")]
    help: String,
    #[serde(rename = "@detail")]
    detail: u32,
    #[serde(rename = "@type")]
    counter_type: u32,
    #[serde(rename = "@max-size")]
    max_size: u32,
    #[serde(rename = "@offset")]
    offset: u32,
    #[serde(rename = "@default-scale")]
    default_scale: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlInstance {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "$text", default)]
    data: String,
}

/// One instance and a copy of its counter data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInstance {
    pub id: u32,
    pub name: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCategory {
    pub definition: CategoryDefinition,
    pub instances: Vec<SnapshotInstance>,
}

/// A copy of a repository's categories and live instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub categories: Vec<SnapshotCategory>,
}

impl From<&CounterDefinition> for XmlCounter {
    fn from(counter: &CounterDefinition) -> Self {
        Self {
            id: counter.id,
            name: counter.name.clone(),
            help: counter.help.clone(),
            detail: counter.detail_level,
            counter_type: counter.counter_type.0,
            max_size: counter.max_size,
            offset: counter.offset,
            default_scale: counter.default_scale,
        }
    }
}

impl From<XmlCounter> for CounterDefinition {
    fn from(counter: XmlCounter) -> Self {
        Self {
            id: counter.id,
            name: counter.name,
            help: counter.help,
            detail_level: counter.detail,
            counter_type: CounterType(counter.counter_type),
            max_size: counter.max_size,
            offset: counter.offset,
            default_scale: counter.default_scale,
        }
    }
}

impl From<&SnapshotCategory> for XmlCategory {
    fn from(category: &SnapshotCategory) -> Self {
        let definition = &category.definition;
        Self {
            id: definition.id,
            name: definition.name.clone(),
            help: definition.help.clone(),
            detail: definition.detail_level,
            default_counter: definition.default_counter,
            instanceless: definition.instanceless,
            struct_size: definition.struct_size,
            max_name_len: definition.max_name_len,
            counters: definition.counters.iter().map(XmlCounter::from).collect(),
            instances: category
                .instances
                .iter()
                .map(|instance| XmlInstance {
                    id: instance.id,
                    name: instance.name.clone(),
                    data: STANDARD.encode(&instance.data),
                })
                .collect(),
        }
    }
}

impl TryFrom<XmlCategory> for SnapshotCategory {
    type Error = RepositoryError;

    fn try_from(xml: XmlCategory) -> Result<Self> {
        let category_id = xml.id;
        let malformed = |reason: String| {
            RepositoryError::MalformedSnapshot(format!("category {category_id}: {reason}"))
        };

        let definition = CategoryDefinition {
            id: xml.id,
            name: xml.name,
            help: xml.help,
            detail_level: xml.detail,
            default_counter: xml.default_counter,
            instanceless: xml.instanceless,
            struct_size: xml.struct_size,
            max_name_len: xml.max_name_len,
            counters: xml.counters.into_iter().map(CounterDefinition::from).collect(),
        };
        // Counter ids and offsets go through the same checks as registration.
        SchemaRegistry::new()
            .add_category(definition.clone())
            .map_err(|e| malformed(e.to_string()))?;

        if definition.instanceless && xml.instances.len() > 1 {
            return Err(malformed(format!(
                "{} instances of an instanceless category",
                xml.instances.len()
            )));
        }
        let mut instances: Vec<SnapshotInstance> = Vec::with_capacity(xml.instances.len());
        for instance in xml.instances {
            let data = STANDARD.decode(instance.data.trim())?;
            if data.len() != definition.struct_size as usize {
                return Err(malformed(format!(
                    "instance {} carries {} bytes, struct size is {}",
                    instance.id,
                    data.len(),
                    definition.struct_size
                )));
            }
            let repeated = instance
                .name
                .as_ref()
                .filter(|name| instances.iter().any(|i| i.name.as_ref() == Some(*name)));
            if let Some(name) = repeated {
                return Err(malformed(format!("instance name {name:?} repeats")));
            }
            instances.push(SnapshotInstance {
                id: instance.id,
                name: instance.name,
                data,
            });
        }

        Ok(Self {
            definition,
            instances,
        })
    }
}

impl Snapshot {
    /// Groups `instances` under their registered categories, in registration order.
    pub(crate) fn capture(schema: &SchemaRegistry, instances: &[InstanceInfo]) -> Self {
        let categories = schema
            .categories()
            .map(|definition| SnapshotCategory {
                definition: definition.clone(),
                instances: instances
                    .iter()
                    .filter(|i| i.category_id == definition.id)
                    .map(|i| SnapshotInstance {
                        id: i.instance_id,
                        name: i.name.clone(),
                        data: i.data.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self { categories }
    }

    /// Number of instances across every category.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.categories.iter().map(|c| c.instances.len()).sum()
    }

    /// Writes the categories as a document fragment.
    ///
    /// `first` opens the document and `last` closes it, so a large
    /// repository can be written in several calls that together form one
    /// document.
    ///
    /// # Errors
    /// IO errors from `writer`, or a category the XML serializer rejects.
    pub fn write_xml<W: Write>(&self, mut writer: W, first: bool, last: bool) -> Result<()> {
        if first {
            writeln!(writer, "{XML_DECLARATION}")?;
            writeln!(writer, "<snapshot>")?;
        }
        for category in &self.categories {
            let xml = quick_xml::se::to_string_with_root("category", &XmlCategory::from(category))?;
            writeln!(writer, "{xml}")?;
        }
        if last {
            writeln!(writer, "</snapshot>")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Parses and validates a complete document.
    ///
    /// # Errors
    /// `MalformedSnapshot` when an element misses a required attribute,
    /// carries an invalid value, or counter data does not match the
    /// category's struct size.
    pub fn read_xml<R: BufRead>(reader: R) -> Result<Self> {
        let document: XmlSnapshot = quick_xml::de::from_reader(reader)?;
        let mut categories: Vec<SnapshotCategory> = Vec::with_capacity(document.categories.len());
        for xml in document.categories {
            let category = SnapshotCategory::try_from(xml)?;
            if categories
                .iter()
                .any(|c| c.definition.id == category.definition.id)
            {
                return Err(RepositoryError::MalformedSnapshot(format!(
                    "category {} repeats",
                    category.definition.id
                )));
            }
            categories.push(category);
        }
        Ok(Self { categories })
    }
}
