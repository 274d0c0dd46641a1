//! SSE status push for a workflow instance.
//!
//! The stream re-reads the instance snapshot every `status_poll_ms`, or
//! sooner when the engine publishes an event for that instance, and pushes
//! the full snapshot each time. It closes after the first terminal snapshot.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use stepwave_core::workflow::EngineError;
use stepwave_infra::engine::SqliteEngine;
use stepwave_types::workflow::InstanceSnapshot;

use crate::http::error::AppError;
use crate::state::AppState;

/// GET /api/v1/instances/{id}/stream - Server-sent snapshots until terminal.
///
/// Events: `snapshot` (full instance snapshot), `error`, and a final `done`.
pub async fn stream_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Unknown ids fail as a plain 404 rather than an empty stream.
    state.engine.get_instance_status(&id).await?;

    let updates = snapshot_updates(state.engine.clone(), id);
    let sse_stream = async_stream::stream! {
        let mut updates = std::pin::pin!(updates);
        while let Some(update) = updates.next().await {
            let event = match update {
                Ok(snapshot) => Event::default().event("snapshot").json_data(&snapshot),
                Err(e) => {
                    let data = serde_json::json!({ "message": e.to_string() });
                    Ok(Event::default().event("error").data(data.to_string()))
                }
            };
            match event {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "failed to encode snapshot");
                    break;
                }
            }
        }
        yield Ok(Event::default().event("done").data("{}"));
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Snapshots of one instance, ending after the first terminal one (or the
/// first read error).
pub fn snapshot_updates(
    engine: SqliteEngine,
    id: Uuid,
) -> impl Stream<Item = Result<InstanceSnapshot, EngineError>> {
    let poll = engine.config().status_poll();
    let mut events = engine.events().subscribe();

    async_stream::stream! {
        loop {
            match engine.get_instance_status(&id).await {
                Ok(snapshot) => {
                    let terminal = snapshot.instance.status.is_terminal();
                    yield Ok(snapshot);
                    if terminal {
                        break;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }

            let sleep = tokio::time::sleep(poll);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    received = events.recv() => match received {
                        Ok(event) if event.instance_id() == id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => {
                            (&mut sleep).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use serde_json::json;
    use stepwave_types::workflow::{InstanceStatus, StepDefinition, WorkflowTemplate};

    #[tokio::test]
    async fn test_updates_end_with_terminal_snapshot() {
        let state = test_state().await;
        let def: StepDefinition = serde_json::from_value(json!({
            "id": "noop",
            "name": "Noop",
            "kind": {"type": "function", "body": "1"}
        }))
        .unwrap();
        state.engine.register_definition(&def).await.unwrap();
        let template: WorkflowTemplate = serde_json::from_value(json!({
            "id": "tpl",
            "name": "Two waves",
            "waves": {
                "1": {"a": {"definition_id": "noop"}},
                "2": {"b": {"definition_id": "noop"}}
            }
        }))
        .unwrap();
        let id = state
            .engine
            .create_instance(&template, Default::default())
            .await
            .unwrap();

        let collected = tokio::time::timeout(
            Duration::from_secs(10),
            snapshot_updates(state.engine.clone(), id).collect::<Vec<_>>(),
        )
        .await
        .expect("stream should close once the instance finishes");

        assert!(!collected.is_empty());
        let last = collected.last().unwrap().as_ref().unwrap();
        assert_eq!(last.instance.status, InstanceStatus::Completed);
        assert!(
            collected[..collected.len() - 1]
                .iter()
                .all(|s| !s.as_ref().unwrap().instance.status.is_terminal())
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_stream_is_rejected() {
        let state = test_state().await;
        let result = stream_instance(State(state), Path(Uuid::now_v7())).await;
        assert!(matches!(
            result,
            Err(AppError::Engine(EngineError::InstanceNotFound(_)))
        ));
    }
}
