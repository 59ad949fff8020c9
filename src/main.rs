use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use warp::Filter;

use converse::auth::{Handshake, SharedSecretVerifier};
use converse::config::{load_config, DEFAULT_CONFIG_PATH};
use converse::directory::MemoryDirectory;
use converse::server::Server;
use converse::store::MemoryStore;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = load_config(DEFAULT_CONFIG_PATH);
    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("Invalid listen address {}: {err}", config.listen_addr);
            return;
        }
    };

    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    for profile in &config.seed_users {
        directory.register(profile.clone()).await;
    }
    let verifier = Arc::new(SharedSecretVerifier::new(config.auth_secret.clone()));
    let server = Arc::new(Server::new(store, directory, verifier));

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .map(
            move |ws: warp::ws::Ws,
                  authorization: Option<String>,
                  query: HashMap<String, String>| {
                let server = server.clone();
                let handshake = Handshake {
                    authorization,
                    auth_token: query.get("auth").cloned(),
                    query_token: query.get("token").cloned(),
                };
                ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket, handshake).await;
                })
            },
        );

    info!("Chat server listening on {addr}");
    warp::serve(ws_route).run(addr).await;
}
