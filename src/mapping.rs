use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::Result;
use crate::map::Map;

/// Submission options shared by every component of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    /// Memory each component needs, in MB
    pub request_memory_mb: u64,
    /// Disk space each component needs, in KB
    pub request_disk_kb: u64,
    /// Extra environment variables for every component
    pub env: BTreeMap<String, String>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            request_memory_mb: 128,
            request_disk_kb: 1024,
            env: BTreeMap::new(),
        }
    }
}

impl MapOptions {
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.request_memory_mb = memory_mb;
        self
    }

    pub fn with_disk_kb(mut self, disk_kb: u64) -> Self {
        self.request_disk_kb = disk_kb;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A shell command that can be mapped over inputs.
///
/// The command runs under `sh -c`; a component's arguments are available as
/// `$1`, `$2`, ... and its standard output, minus trailing newlines, is its output.
#[derive(Clone)]
pub struct MappedCommand {
    engine: Arc<Engine>,
    command: String,
    options: MapOptions,
}

impl std::fmt::Debug for MappedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedCommand")
            .field("command", &self.command)
            .field("options", &self.options)
            .finish()
    }
}

impl MappedCommand {
    pub fn new(engine: Arc<Engine>, command: impl Into<String>, options: MapOptions) -> Self {
        Self {
            engine,
            command: command.into(),
            options,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    /// Submit one component per input, each input becoming the single argument `$1`.
    /// Without a tag the map gets a random, transient one.
    pub async fn map<I, S>(&self, tag: Option<&str>, inputs: I) -> Result<Map>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = inputs.into_iter().map(|input| vec![input.into()]).collect();
        self.submit(tag, args).await
    }

    /// Submit one component per argument list.
    pub async fn starmap<I, A, S>(&self, tag: Option<&str>, args: I) -> Result<Map>
    where
        I: IntoIterator<Item = A>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args
            .into_iter()
            .map(|a| a.into_iter().map(Into::into).collect())
            .collect();
        self.submit(tag, args).await
    }

    async fn submit(&self, tag: Option<&str>, args: Vec<Vec<String>>) -> Result<Map> {
        self.engine
            .submit(tag, self.command.clone(), self.options.clone(), args)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = MapOptions::default();
        assert_eq!(options.request_memory_mb, 128);
        assert_eq!(options.request_disk_kb, 1024);
        assert!(options.env.is_empty());
    }

    #[test]
    fn option_builders() {
        let options = MapOptions::default()
            .with_memory_mb(512)
            .with_disk_kb(2048)
            .with_env("GREETING", "hi");
        assert_eq!(options.request_memory_mb, 512);
        assert_eq!(options.request_disk_kb, 2048);
        assert_eq!(options.env.get("GREETING").map(String::as_str), Some("hi"));
    }
}
