use std::sync::Arc;

use crate::Parameter;

/// A selectable game world.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct World {
    pub number: u32,
    pub members: bool,
}

impl World {
    /// Largest world number the store can hold.
    pub const MAX_NUMBER: u32 = i32::MAX as u32;

    pub fn new(number: u32, members: bool) -> Self {
        Self { number, members }
    }
}

impl Parameter for World {
    fn to_parameter(&self) -> Vec<String> {
        vec!["-world".to_string(), self.number.to_string()]
    }
}

/// The full set of worlds currently known to the application.
///
/// Only consulted when upgrading records that predate world pools.
pub trait WorldCatalog {
    fn worlds(&self) -> Vec<Arc<World>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticWorldCatalog {
    worlds: Vec<Arc<World>>,
}

impl StaticWorldCatalog {
    pub fn new(worlds: Vec<World>) -> Self {
        Self {
            worlds: worlds.into_iter().map(Arc::new).collect(),
        }
    }

    /// Parses a comma separated list like `301,302,m:303`. A `m:` prefix marks a
    /// members world.
    pub fn parse(list: &str) -> anyhow::Result<Self> {
        let mut worlds = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (members, number) = match raw.strip_prefix("m:") {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let number: u32 = number
                .parse()
                .ok()
                .filter(|n| *n <= World::MAX_NUMBER)
                .ok_or_else(|| anyhow::anyhow!("invalid world number: {raw}"))?;
            worlds.push(World::new(number, members));
        }
        Ok(Self::new(worlds))
    }
}

impl WorldCatalog for StaticWorldCatalog {
    fn worlds(&self) -> Vec<Arc<World>> {
        self.worlds.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_catalog_list() {
        let catalog = StaticWorldCatalog::parse("301, m:302,,303").unwrap();
        let worlds = catalog.worlds();
        assert_eq!(worlds.len(), 3);
        assert_eq!(*worlds[1], World::new(302, true));
        assert_eq!(worlds[2].to_parameter(), vec!["-world", "303"]);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = StaticWorldCatalog::parse("301,abc").unwrap_err();
        assert!(err.to_string().contains("invalid world number"));
        assert!(StaticWorldCatalog::parse("2147483647").is_ok());
        assert!(StaticWorldCatalog::parse("3000000000").is_err());
    }
}
