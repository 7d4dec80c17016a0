pub mod block_pool;
pub mod buffer_pool;
pub mod fixed_buffer;
