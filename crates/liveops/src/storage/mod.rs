pub mod memory_store;

#[cfg(feature = "etcd")]
pub mod etcd_store;
