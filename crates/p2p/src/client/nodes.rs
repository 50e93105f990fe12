//! Node store implementations.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use dexd_types::PubKey;

use crate::common::node::{Node, Store};

/// An in-memory store. Nothing survives the process; used in tests and by
/// deployments that treat the catalog as disposable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: HashMap<PubKey, Node>,
}

impl Store for MemoryStore {
    fn load(&mut self) -> io::Result<Vec<Node>> {
        Ok(self.nodes.values().cloned().collect())
    }

    fn upsert(&mut self, node: &Node) -> io::Result<()> {
        self.nodes.insert(node.pub_key, node.clone());
        Ok(())
    }

    fn remove(&mut self, pub_key: &PubKey) -> io::Result<()> {
        self.nodes.remove(pub_key);
        Ok(())
    }
}

/// A JSON file store. The whole catalog is rewritten on every mutation;
/// small enough in practice that this beats a database dependency.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    nodes: HashMap<PubKey, Node>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nodes: HashMap::new(),
        }
    }

    fn write_all(&self) -> io::Result<()> {
        let nodes = self.nodes.values().collect::<Vec<_>>();
        let tmp = self.path.with_extension("tmp");

        let file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(file, &nodes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::rename(&tmp, &self.path)
    }
}

impl Store for JsonFileStore {
    fn load(&mut self) -> io::Result<Vec<Node>> {
        let nodes: Vec<Node> = match fs::File::open(&self.path) {
            Ok(file) => serde_json::from_reader(file)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };

        self.nodes = nodes.iter().map(|n| (n.pub_key, n.clone())).collect();
        Ok(nodes)
    }

    fn upsert(&mut self, node: &Node) -> io::Result<()> {
        self.nodes.insert(node.pub_key, node.clone());
        self.write_all()
    }

    fn remove(&mut self, pub_key: &PubKey) -> io::Result<()> {
        self.nodes.remove(pub_key);
        self.write_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexd_types::NodeAddress;

    #[test]
    fn json_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("dexd-nodes-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nodes.json");

        let mut node = Node::new(
            PubKey::new([3; 33]),
            vec![NodeAddress::new("192.0.2.7", 9735)],
        );
        node.reputation_score = -30;

        {
            let mut store = JsonFileStore::new(&path);
            store.load().unwrap();
            store.upsert(&node).unwrap();
        }

        let mut reopened = JsonFileStore::new(&path);
        let loaded = reopened.load().unwrap();

        assert_eq!(loaded, vec![node.clone()]);

        reopened.remove(&node.pub_key).unwrap();
        let mut emptied = JsonFileStore::new(&path);
        assert!(emptied.load().unwrap().is_empty());

        fs::remove_dir_all(&dir).ok();
    }
}
