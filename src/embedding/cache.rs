/// Bounded process-local cache of text embeddings
use ahash::AHashMap;
use std::collections::VecDeque;

/// FIFO-evicting map from text to vector
pub struct EmbeddingCache {
    entries: AHashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: AHashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, text: &str) -> Option<Vec<f32>> {
        match self.entries.get(text) {
            Some(vector) => {
                self.hits += 1;
                Some(vector.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, text: String, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.contains_key(&text) {
            self.entries.insert(text, vector);
            return;
        }

        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.order.push_back(text.clone());
        self.entries.insert(text, vector);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
