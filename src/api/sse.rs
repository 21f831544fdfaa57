use crate::events::Event;
use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future, stream};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
}

fn to_sse(event: &Event) -> SseEvent {
    match SseEvent::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::warn!(target: "api::sse", event = event.name(), error = %e, "Failed to encode event");
            SseEvent::default().comment("encode error")
        }
    }
}

/// Events for one subscriber: the session's current state when a session
/// is named, then live events passing the filters.
pub(crate) fn event_stream(state: &AppState, query: EventsQuery) -> impl Stream<Item = Event> + Send + use<> {
    let receiver = state.events.subscribe();
    let initial = query
        .session_id
        .as_deref()
        .and_then(|id| match state.uploads.sessions().get_session_state(id) {
            Ok(current) => current.map(Event::UploadProgress),
            Err(e) => {
                tracing::warn!(target: "api::sse", session_id = %id, error = %e, "Failed to load session state");
                None
            }
        });

    let EventsQuery {
        workspace_id,
        session_id,
    } = query;
    let live = BroadcastStream::new(receiver).filter_map(move |message| {
        let event = match message {
            Ok(event) if event.matches(workspace_id.as_deref(), session_id.as_deref()) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(target: "api::sse", skipped, "SSE client lagged behind");
                None
            }
        };
        future::ready(event)
    });
    stream::iter(initial).chain(live)
}

/// Progress channel. Job updates are filtered by workspace and upload
/// snapshots by session.
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    tracing::info!(
        target: "api::sse",
        workspace_id = ?query.workspace_id,
        session_id = ?query.session_id,
        "SSE client connected"
    );
    let events = event_stream(&state, query).map(|event| Ok(to_sse(&event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}
