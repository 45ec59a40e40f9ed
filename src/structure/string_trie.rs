use rustc_hash::FxHashMap;

struct TrieNode<V> {
    value: Option<V>,
    children: FxHashMap<u8, usize>,
}

impl<V> TrieNode<V> {
    fn new() -> TrieNode<V> {
        TrieNode {
            value: None,
            children: FxHashMap::default(),
        }
    }
}

/// Maps byte strings to values with a lookup cost proportional to the key length. Nodes are
///  kept in a single vector and never freed, so removing a key only clears its value.
pub struct StringTrie<V> {
    nodes: Vec<TrieNode<V>>,
    len: usize,
}

impl<V> Default for StringTrie<V> {
    fn default() -> Self {
        StringTrie::new()
    }
}

impl<V> StringTrie<V> {
    const ROOT: usize = 0;

    pub fn new() -> StringTrie<V> {
        StringTrie {
            nodes: vec![TrieNode::new()],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        key.iter().try_fold(Self::ROOT, |idx, b| self.nodes[idx].children.get(b).copied())
    }

    /// Returns the previous value for the key
    pub fn set(&mut self, key: impl AsRef<[u8]>, value: V) -> Option<V> {
        let mut idx = Self::ROOT;
        for &b in key.as_ref() {
            idx = match self.nodes[idx].children.get(&b) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::new());
                    self.nodes[idx].children.insert(b, child);
                    child
                }
            };
        }

        let previous = self.nodes[idx].value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub fn lookup(&self, key: impl AsRef<[u8]>) -> Option<&V> {
        self.find(key.as_ref())
            .and_then(|idx| self.nodes[idx].value.as_ref())
    }

    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Option<V> {
        let idx = self.find(key.as_ref())?;
        let removed = self.nodes[idx].value.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }
}
