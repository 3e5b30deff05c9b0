pub mod hashmap;

pub use hashmap::HashMapChainStorage;
