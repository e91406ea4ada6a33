//! Provider descriptors and stage interfaces
//!
//! Every provider implements one stage of the four-stage module shape:
//!
//! ```text
//!  Loader ──► enumerates further providers
//!  ContextBuilder (stage 4) ──► builds a context of kind K from node options
//!  ContextConverter (stage 6) ──► turns a context of kind K into kind L
//!  Processor (stage 7) ──► fills a ticket, consuming a context of kind L
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::ContextHandle;
use crate::error::Result;
use crate::graph::ProcessContext;
use crate::rank::{PropertySnapshot, RankEntry, RankTable};
use crate::registration::{RegistrationKey, RegistrationPattern};

use super::ProviderSource;

/// The stage a provider implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Loader,
    ContextBuilder,
    ContextConverter,
    Processor,
}

impl CapabilityKind {
    /// Stage number used by stage-bound pattern attributes
    pub fn stage(&self) -> u8 {
        match self {
            CapabilityKind::ContextBuilder => 4,
            CapabilityKind::Loader => 5,
            CapabilityKind::ContextConverter => 6,
            CapabilityKind::Processor => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Loader => "loader",
            CapabilityKind::ContextBuilder => "context_builder",
            CapabilityKind::ContextConverter => "context_converter",
            CapabilityKind::Processor => "processor",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data shape a connector offers (socket) or accepts (plug)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCapability {
    /// Registration text: a key on sockets, a pattern on plugs
    pub data_type: String,
    /// Channel count, `None` for any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

impl DataCapability {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            channels: None,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Check whether a plug accepting `self` can bind a socket offering `offered`.
    ///
    /// Returns the reason on failure.
    pub fn accepts(&self, offered: &DataCapability) -> std::result::Result<(), String> {
        let key = RegistrationKey::parse(&offered.data_type).map_err(|e| e.to_string())?;
        let pattern = RegistrationPattern::parse(&self.data_type).map_err(|e| e.to_string())?;

        if !pattern.matches(&key, None) {
            return Err(format!(
                "data type '{}' does not satisfy '{}'",
                offered.data_type, self.data_type
            ));
        }
        match (self.channels, offered.channels) {
            (Some(wanted), Some(got)) if wanted != got => {
                Err(format!("expected {} channels, socket offers {}", wanted, got))
            }
            _ => Ok(()),
        }
    }
}

/// A plug or socket a provider's nodes expose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub name: String,
    pub capability: DataCapability,
    /// Plugs only: pulling fails while a mandatory plug is unbound
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

impl ConnectorDescriptor {
    pub fn new(name: impl Into<String>, capability: DataCapability) -> Self {
        Self {
            name: name.into(),
            capability,
            mandatory: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

/// Static description of a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique provider id
    pub id: String,
    pub registration: RegistrationKey,
    #[serde(default)]
    pub rank_table: RankTable,
    /// Declared properties supplying expected values to the rank table
    #[serde(default)]
    pub properties: PropertySnapshot,
    #[serde(default)]
    pub plugs: Vec<ConnectorDescriptor>,
    #[serde(default)]
    pub sockets: Vec<ConnectorDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl ProviderDescriptor {
    /// Descriptor with a parsed registration key
    pub fn new(id: impl Into<String>, registration: &str) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            registration: RegistrationKey::parse(registration)?,
            rank_table: RankTable::new(),
            properties: PropertySnapshot::new(),
            plugs: Vec::new(),
            sockets: Vec::new(),
            api_version: None,
        })
    }

    pub fn with_rank_entry(mut self, entry: RankEntry) -> Self {
        self.rank_table = self.rank_table.with_entry(entry);
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn with_plug(mut self, plug: ConnectorDescriptor) -> Self {
        self.plugs.push(plug);
        self
    }

    pub fn with_socket(mut self, socket: ConnectorDescriptor) -> Self {
        self.sockets.push(socket);
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }
}

/// Options a node passes to its providers
///
/// Ordered, so their text form is canonical and can key the context cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeOptions {
    values: BTreeMap<String, String>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set a value, returning the previous one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable JSON text; distinct option sets never share it
    pub fn canonical_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.values)?)
    }
}

/// What a context builder or converter is asked to produce
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Capability request of the node
    pub request: &'a str,
    pub options: &'a NodeOptions,
    /// Data shapes of the sockets bound to the node's plugs
    pub inputs: &'a [DataCapability],
}

/// Stage 4: builds contexts from node options
pub trait ContextBuilder: Send + Sync {
    /// Resource kind of built contexts
    fn context_kind(&self) -> &str;

    fn build(&self, request: &BuildRequest<'_>) -> Result<ContextHandle>;
}

/// Stage 6: converts contexts between resource kinds
pub trait ContextConverter: Send + Sync {
    fn input_kind(&self) -> &str;

    fn output_kind(&self) -> &str;

    fn convert(&self, source: &ContextHandle, request: &BuildRequest<'_>) -> Result<ContextHandle>;
}

/// Stage 7: fills tickets
pub trait Processor: Send + Sync {
    /// Resource kind of the context this processor consumes, if any
    fn context_kind(&self) -> Option<&str>;

    fn process(&self, ctx: &mut ProcessContext<'_>) -> Result<()>;
}

/// A provider's implementation
#[derive(Clone)]
pub enum Stage {
    Loader(Arc<dyn ProviderSource>),
    ContextBuilder(Arc<dyn ContextBuilder>),
    ContextConverter(Arc<dyn ContextConverter>),
    Processor(Arc<dyn Processor>),
    /// Descriptor only: resolvable, not executable
    Declared(CapabilityKind),
}

impl Stage {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Stage::Loader(_) => CapabilityKind::Loader,
            Stage::ContextBuilder(_) => CapabilityKind::ContextBuilder,
            Stage::ContextConverter(_) => CapabilityKind::ContextConverter,
            Stage::Processor(_) => CapabilityKind::Processor,
            Stage::Declared(kind) => *kind,
        }
    }
}

/// A registered provider: descriptor plus implementation
pub struct Provider {
    pub descriptor: ProviderDescriptor,
    pub stage: Stage,
}

impl Provider {
    pub fn loader(descriptor: ProviderDescriptor, source: impl ProviderSource + 'static) -> Self {
        Self {
            descriptor,
            stage: Stage::Loader(Arc::new(source)),
        }
    }

    pub fn context_builder(descriptor: ProviderDescriptor, builder: impl ContextBuilder + 'static) -> Self {
        Self {
            descriptor,
            stage: Stage::ContextBuilder(Arc::new(builder)),
        }
    }

    pub fn context_converter(
        descriptor: ProviderDescriptor,
        converter: impl ContextConverter + 'static,
    ) -> Self {
        Self {
            descriptor,
            stage: Stage::ContextConverter(Arc::new(converter)),
        }
    }

    pub fn processor(descriptor: ProviderDescriptor, processor: impl Processor + 'static) -> Self {
        Self {
            descriptor,
            stage: Stage::Processor(Arc::new(processor)),
        }
    }

    pub fn declared(descriptor: ProviderDescriptor, kind: CapabilityKind) -> Self {
        Self {
            descriptor,
            stage: Stage::Declared(kind),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn kind(&self) -> CapabilityKind {
        self.stage.kind()
    }

    pub fn registration(&self) -> &RegistrationKey {
        &self.descriptor.registration
    }

    /// Whether `required` names this provider: its id, or an attribute of
    /// its key's last segment (`lcm2` for `.../icc._lcm2`)
    pub fn answers_to(&self, required: &str) -> bool {
        self.descriptor.id == required || self.descriptor.registration.last_segment().contains(required)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.descriptor.id)
            .field("kind", &self.kind())
            .field("registration", &self.descriptor.registration.as_str())
            .finish()
    }
}

/// Counted reference to a registered provider
///
/// Cloning takes a reference, dropping releases it.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<Provider>,
}

impl ProviderHandle {
    pub(crate) fn new(inner: Arc<Provider>) -> Self {
        Self { inner }
    }

    /// Live references, including the registry's own
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_provider(&self, other: &ProviderHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for ProviderHandle {
    type Target = Provider;

    fn deref(&self) -> &Provider {
        &self.inner
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
