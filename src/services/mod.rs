pub mod bot_api_transport;
pub mod chunk_reader;
pub mod finalize;
pub mod memory_transport;
pub mod session_store;
pub mod sweeper;
pub mod transport;
pub mod upload_client;
pub mod upload_queue;
pub mod upload_service;
