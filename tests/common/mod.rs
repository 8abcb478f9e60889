#![allow(dead_code)]

use hcloud_upload::{
    app,
    routes::cors::CorsPolicy,
    services::{memory_transport::MemoryTransport, session_store::SessionStore},
};
use std::sync::Arc;
use tokio::net::TcpListener;

pub const MAX_BODY: usize = 10 * 1024 * 1024;

pub struct TestServer {
    pub base_url: String,
    pub store: SessionStore,
    pub transport: MemoryTransport,
}

pub async fn spawn_with(cors: CorsPolicy, max_body: usize) -> TestServer {
    let store = SessionStore::with_defaults();
    let transport = MemoryTransport::new();
    let router = app(store.clone(), Arc::new(transport.clone()), cors, max_body);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        store,
        transport,
    }
}

pub async fn spawn_with_cors(cors: CorsPolicy) -> TestServer {
    spawn_with(cors, MAX_BODY).await
}

pub async fn spawn() -> TestServer {
    spawn_with_cors(CorsPolicy::Any).await
}
