//! Read-only HTTP status endpoint.
//!
//! `GET /gimme` renders the mailbox as a node/link graph: JSON when the
//! request carries an `ApiVersion` header, an HTML pretty-print otherwise.
//! Everything is derived from the mapped mailbox, so this never touches
//! the registry lock.

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tracing::info;

use famez_mailbox::MailboxRegion;

/// Shared, thread-safe view for the endpoint.
#[derive(Clone)]
pub struct StatusState {
    pub mailbox: Arc<MailboxRegion>,
}

#[derive(Serialize)]
struct StatusDump {
    #[serde(rename = "nClients")]
    nclients: u64,
    server_famez_id: u64,
    nodes: Vec<Node>,
    links: Vec<Link>,
}

#[derive(Serialize)]
struct Node {
    famez_id: u64,
    id: String,
    cclass: String,
    group: u32,
}

#[derive(Serialize)]
struct Link {
    source: String,
    target: String,
}

/// Serve the status endpoint until the process exits.
pub async fn serve(state: StatusState, port: u16) -> io::Result<()> {
    let app = Router::new()
        .route("/", get(home))
        .route("/gimme", get(gimme))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status endpoint listening");
    axum::serve(listener, app).await
}

fn snapshot(mailbox: &MailboxRegion) -> StatusDump {
    let server_id = mailbox.server_id();
    let mut nodes = Vec::new();
    let mut links = Vec::new();

    for famez_id in 1..=server_id {
        let nodename = mailbox.nodename(famez_id).unwrap_or_default();
        let cclass = mailbox.cclass(famez_id).unwrap_or_default();
        // QEMU nodes carry the card number as part of the name.
        let port = nodename.split('.').nth(1).unwrap_or("0").to_string();
        let group = if famez_id == server_id { 2 } else { 1 };
        if famez_id != server_id && !nodename.is_empty() {
            links.push(Link {
                source: format!("{}.{}", famez_id, port),
                target: format!("{}.{}", server_id, famez_id),
            });
        }
        nodes.push(Node {
            famez_id,
            id: nodename,
            cclass,
            group,
        });
    }

    StatusDump {
        nclients: mailbox.nclients(),
        server_famez_id: server_id,
        nodes,
        links,
    }
}

async fn gimme(State(state): State<StatusState>, headers: HeaderMap) -> Response {
    let dump = snapshot(&state.mailbox);
    if headers.contains_key("apiversion") {
        axum::Json(dump).into_response()
    } else {
        let pretty = serde_json::to_string_pretty(&dump).unwrap_or_default();
        Html(format!("<PRE>{}</PRE>", pretty)).into_response()
    }
}

async fn home(headers: HeaderMap) -> Html<String> {
    let mut names: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
    names.sort();
    Html(format!("<PRE>\n{}\nUse /gimme\n</PRE>", names.join("\n")))
}
