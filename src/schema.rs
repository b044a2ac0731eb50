use crate::{
    collect::CategoryLayout,
    error::{RepositoryError, Result},
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Default maximum instance name length, in characters.
pub const DEFAULT_MAX_INSTANCE_NAME_LEN: u32 = 64;

/// Detail levels understood by collectors.
pub mod detail {
    pub const NOVICE: u32 = 100;
    pub const ADVANCED: u32 = 200;
    pub const EXPERT: u32 = 300;
    pub const WIZARD: u32 = 400;
}

const SIZE_MASK: u32 = 0x0000_0300;
const TYPE_MASK: u32 = 0x0000_0C00;
const SIZE_DWORD: u32 = 0x0000_0000;
const SIZE_LARGE: u32 = 0x0000_0100;
const SIZE_ZERO: u32 = 0x0000_0200;
const TYPE_TEXT: u32 = 0x0000_0800;

/// Storage width of a counter, taken from the size bits of its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Dword,
    Large,
    Zero,
    Variable,
}

/// A counter type in the collector's bit-field encoding.
///
/// The size bits select how many bytes the counter occupies in the instance
/// data, the type bits select how a collector interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterType(pub u32);

impl CounterType {
    pub const RAW_COUNT: Self = Self(0x0001_0000);
    pub const RAW_COUNT_HEX: Self = Self(0x0000_0000);
    pub const LARGE_RAW_COUNT: Self = Self(0x0001_0100);
    pub const COUNTER: Self = Self(0x1041_0400);
    pub const BULK_COUNT: Self = Self(0x1041_0500);
    pub const RAW_FRACTION: Self = Self(0x2002_0400);
    pub const RAW_BASE: Self = Self(0x4003_0403);
    pub const AVERAGE_TIMER: Self = Self(0x3002_0400);
    pub const AVERAGE_BASE: Self = Self(0x4003_0402);
    pub const ELAPSED_TIME: Self = Self(0x3024_0500);
    pub const TEXT: Self = Self(0x0000_0B00);

    #[must_use]
    pub const fn size_class(self) -> SizeClass {
        match self.0 & SIZE_MASK {
            SIZE_DWORD => SizeClass::Dword,
            SIZE_LARGE => SizeClass::Large,
            SIZE_ZERO => SizeClass::Zero,
            _ => SizeClass::Variable,
        }
    }

    #[must_use]
    pub const fn is_text(self) -> bool {
        self.0 & TYPE_MASK == TYPE_TEXT
    }

    /// Bytes the counter occupies inside instance data.
    #[must_use]
    pub const fn data_size(self, max_size: u32) -> u32 {
        match self.size_class() {
            SizeClass::Dword => 4,
            SizeClass::Large => 8,
            SizeClass::Zero => 0,
            SizeClass::Variable => max_size,
        }
    }
}

/// A single named field inside a category's instance data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDefinition {
    pub id: u32,
    pub name: String,
    pub help: String,
    pub detail_level: u32,
    pub counter_type: CounterType,
    /// Bytes reserved for variable length (text) counters, terminator
    /// included, ignored otherwise. Counted in bytes, not characters.
    pub max_size: u32,
    /// Byte offset inside the instance data.
    pub offset: u32,
    pub default_scale: i32,
}

impl CounterDefinition {
    #[must_use]
    pub fn new(id: u32, name: &str, counter_type: CounterType, offset: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            help: String::new(),
            detail_level: detail::NOVICE,
            counter_type,
            max_size: 0,
            offset,
            default_scale: 0,
        }
    }

    #[must_use]
    pub fn help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    #[must_use]
    pub const fn detail_level(mut self, detail_level: u32) -> Self {
        self.detail_level = detail_level;
        self
    }

    /// Bytes reserved for a text counter, terminator included.
    #[must_use]
    pub const fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub const fn default_scale(mut self, default_scale: i32) -> Self {
        self.default_scale = default_scale;
        self
    }

    /// Bytes this counter occupies inside instance data.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.counter_type.data_size(self.max_size)
    }

    fn validate(&self, category: &CategoryDefinition) -> Result<()> {
        let invalid = |reason: String| RepositoryError::InvalidCounter {
            category: category.id,
            counter: self.id,
            reason,
        };
        let size = self.size();
        if self.counter_type.size_class() == SizeClass::Variable && size == 0 {
            return Err(invalid("variable length counter needs a max size".into()));
        }
        let end = self
            .offset
            .checked_add(size)
            .ok_or_else(|| invalid("offset overflows".into()))?;
        if end > category.struct_size {
            return Err(invalid(format!(
                "bytes {}..{end} exceed struct size {}",
                self.offset, category.struct_size
            )));
        }
        let align = match self.counter_type.size_class() {
            SizeClass::Dword => 4,
            SizeClass::Large => 8,
            SizeClass::Zero | SizeClass::Variable => 1,
        };
        if self.offset % align != 0 {
            return Err(invalid(format!(
                "offset {} is not aligned to {align} bytes",
                self.offset
            )));
        }
        Ok(())
    }
}

/// A named class of measured entity together with its counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub id: u32,
    pub name: String,
    pub help: String,
    pub detail_level: u32,
    pub default_counter: i32,
    pub instanceless: bool,
    /// Size of the counter data carried by every instance.
    pub struct_size: u32,
    /// Longest instance name in characters, including the terminator the
    /// collect stream adds, so names keep at most `max_name_len - 1`
    /// characters. Zero keeps names whole.
    pub max_name_len: u32,
    pub counters: Vec<CounterDefinition>,
}

impl CategoryDefinition {
    /// Starts a category with instances whose counter data is `struct_size` bytes.
    #[must_use]
    pub fn builder(id: u32, name: &str, struct_size: u32) -> CategoryBuilder {
        CategoryBuilder {
            category: Self {
                id,
                name: name.to_string(),
                help: String::new(),
                detail_level: detail::NOVICE,
                default_counter: 0,
                instanceless: false,
                struct_size,
                max_name_len: DEFAULT_MAX_INSTANCE_NAME_LEN,
                counters: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn counter(&self, counter_id: u32) -> Option<&CounterDefinition> {
        self.counters.iter().find(|c| c.id == counter_id)
    }
}

/// Explicit description of a category and its counter offsets.
#[derive(Debug, Clone)]
pub struct CategoryBuilder {
    category: CategoryDefinition,
}

impl CategoryBuilder {
    #[must_use]
    pub fn help(mut self, help: &str) -> Self {
        self.category.help = help.to_string();
        self
    }

    #[must_use]
    pub const fn detail_level(mut self, detail_level: u32) -> Self {
        self.category.detail_level = detail_level;
        self
    }

    #[must_use]
    pub const fn default_counter(mut self, default_counter: i32) -> Self {
        self.category.default_counter = default_counter;
        self
    }

    #[must_use]
    pub const fn instanceless(mut self) -> Self {
        self.category.instanceless = true;
        self.category.max_name_len = 0;
        self
    }

    /// Longer names are cut to `max_name_len - 1` characters when an
    /// instance is created or looked up.
    #[must_use]
    pub const fn max_name_len(mut self, max_name_len: u32) -> Self {
        self.category.max_name_len = max_name_len;
        self
    }

    #[must_use]
    pub fn counter(mut self, counter: CounterDefinition) -> Self {
        self.category.counters.push(counter);
        self
    }

    #[must_use]
    pub fn build(self) -> CategoryDefinition {
        self.category
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CategoryEntry {
    pub(crate) definition: CategoryDefinition,
    layout: OnceLock<Arc<CategoryLayout>>,
}

impl CategoryEntry {
    fn new(definition: CategoryDefinition) -> Self {
        Self {
            definition,
            layout: OnceLock::new(),
        }
    }

    /// Encoded object and counter definitions, computed on first use.
    pub(crate) fn layout(&self) -> Arc<CategoryLayout> {
        self.layout
            .get_or_init(|| Arc::new(CategoryLayout::new(&self.definition)))
            .clone()
    }
}

/// Registered categories and their counters, in registration order.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: Vec<CategoryEntry>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a category along with any counters it already carries.
    ///
    /// Nothing is registered when the category id is taken or any of its
    /// counters is rejected.
    ///
    /// # Errors
    /// `DuplicateCategory`, `DuplicateCounter` or `InvalidCounter`.
    pub fn add_category(&mut self, category: CategoryDefinition) -> Result<()> {
        if self.category(category.id).is_some() {
            return Err(RepositoryError::DuplicateCategory(category.id));
        }
        for (i, counter) in category.counters.iter().enumerate() {
            if category.counters[..i].iter().any(|c| c.id == counter.id) {
                return Err(RepositoryError::DuplicateCounter {
                    category: category.id,
                    counter: counter.id,
                });
            }
            counter.validate(&category)?;
        }
        log::trace!("registered category {} ({})", category.id, category.name);
        self.entries.push(CategoryEntry::new(category));
        Ok(())
    }

    /// Appends a counter to an already registered category.
    ///
    /// # Errors
    /// `UnknownCategory`, `DuplicateCounter` or `InvalidCounter`.
    pub fn add_counter(&mut self, category_id: u32, counter: CounterDefinition) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.definition.id == category_id)
            .ok_or(RepositoryError::UnknownCategory(category_id))?;
        if entry.definition.counter(counter.id).is_some() {
            return Err(RepositoryError::DuplicateCounter {
                category: category_id,
                counter: counter.id,
            });
        }
        counter.validate(&entry.definition)?;
        entry.definition.counters.push(counter);
        entry.layout = OnceLock::new();
        Ok(())
    }

    /// Drops every category and counter.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn category(&self, category_id: u32) -> Option<&CategoryDefinition> {
        self.entry(category_id).map(|e| &e.definition)
    }

    #[must_use]
    pub fn counter(&self, category_id: u32, counter_id: u32) -> Option<&CounterDefinition> {
        self.category(category_id)?.counter(counter_id)
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryDefinition> {
        self.entries.iter().map(|e| &e.definition)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, category_id: u32) -> Option<&CategoryEntry> {
        self.entries.iter().find(|e| e.definition.id == category_id)
    }

    pub(crate) fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let categories: Vec<&CategoryDefinition> = self.categories().collect();
        rmp_serde::to_vec(&categories).map_err(RepositoryError::from)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let categories: Vec<CategoryDefinition> = rmp_serde::from_slice(bytes)?;
        let mut registry = Self::new();
        for category in categories {
            registry.add_category(category)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connections() -> CategoryDefinition {
        CategoryDefinition::builder(1, "Connections", 16)
            .help("Open connections")
            .counter(CounterDefinition::new(1, "Bytes", CounterType::LARGE_RAW_COUNT, 0))
            .counter(CounterDefinition::new(2, "Requests", CounterType::RAW_COUNT, 8))
            .build()
    }

    #[test]
    fn test_counter_type_sizes() {
        assert_eq!(CounterType::RAW_COUNT.data_size(0), 4);
        assert_eq!(CounterType::LARGE_RAW_COUNT.data_size(0), 8);
        assert_eq!(CounterType::BULK_COUNT.size_class(), SizeClass::Large);
        assert_eq!(CounterType::TEXT.data_size(32), 32);
        assert!(CounterType::TEXT.is_text());
        assert!(!CounterType::COUNTER.is_text());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SchemaRegistry::new();
        registry.add_category(connections()).unwrap();
        registry
            .add_category(CategoryDefinition::builder(2, "Server", 4).instanceless().build())
            .unwrap();
        registry
            .add_counter(2, CounterDefinition::new(1, "Uptime", CounterType::RAW_COUNT, 0))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.category(1).unwrap().name, "Connections");
        assert_eq!(registry.counter(1, 2).unwrap().offset, 8);
        assert_eq!(registry.counter(2, 1).unwrap().name, "Uptime");
        assert!(registry.category(2).unwrap().instanceless);
    }

    #[test]
    fn test_duplicate_category_keeps_original() {
        let mut registry = SchemaRegistry::new();
        registry.add_category(connections()).unwrap();
        let other = CategoryDefinition::builder(1, "Other", 8).build();

        assert!(matches!(
            registry.add_category(other),
            Err(RepositoryError::DuplicateCategory(1))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.category(1).unwrap().name, "Connections");
    }

    #[test]
    fn test_duplicate_counter_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.add_category(connections()).unwrap();

        let result =
            registry.add_counter(1, CounterDefinition::new(1, "Again", CounterType::RAW_COUNT, 12));
        assert!(matches!(
            result,
            Err(RepositoryError::DuplicateCounter { category: 1, counter: 1 })
        ));
        assert_eq!(registry.counter(1, 1).unwrap().name, "Bytes");
        assert_eq!(registry.category(1).unwrap().counters.len(), 2);
    }

    #[test]
    fn test_counter_before_category() {
        let mut registry = SchemaRegistry::new();
        let result =
            registry.add_counter(7, CounterDefinition::new(1, "Lost", CounterType::RAW_COUNT, 0));
        assert!(matches!(result, Err(RepositoryError::UnknownCategory(7))));
    }

    #[test]
    fn test_counter_offsets_validated() {
        let mut registry = SchemaRegistry::new();
        registry.add_category(connections()).unwrap();

        let past_end = CounterDefinition::new(3, "Past", CounterType::RAW_COUNT, 14);
        assert!(matches!(
            registry.add_counter(1, past_end),
            Err(RepositoryError::InvalidCounter { .. })
        ));

        let misaligned = CounterDefinition::new(4, "Odd", CounterType::LARGE_RAW_COUNT, 4);
        let category = CategoryDefinition::builder(3, "Misaligned", 16)
            .counter(misaligned)
            .build();
        assert!(registry.add_category(category).is_err());
        assert!(registry.category(3).is_none());

        let text = CounterDefinition::new(5, "Label", CounterType::TEXT, 12);
        assert!(registry.add_counter(1, text.clone()).is_err());
        assert!(registry.add_counter(1, text.max_size(4)).is_ok());
    }

    #[test]
    fn test_schema_bytes_round_trip() {
        let mut registry = SchemaRegistry::new();
        registry.add_category(connections()).unwrap();
        let bytes = registry.to_bytes().unwrap();

        let loaded = SchemaRegistry::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.category(1), registry.category(1));
    }
}
