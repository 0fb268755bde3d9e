use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::catalog::{
    self, ActionSpec, BACKEND_ACTIONS, CREATE_SESSION, DELETE_SESSION, GET_SESSION, LIST_SESSIONS,
};
use crate::config::SessionConfig;
use crate::protocol::{Request, Response, GET_CAPABILITIES};
use crate::session::{SessionError, SessionTable};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("{0} is required")]
    MissingParam(&'static str),

    #[error("{name} must be {expected}")]
    InvalidParam {
        name: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[async_trait]
pub trait ActionHandler<B: Backend>: Send + Sync {
    fn spec(&self) -> &'static ActionSpec;

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError>;
}

fn session_id(params: &Map<String, Value>) -> Result<String, DispatchError> {
    match params.get("session_id") {
        None | Some(Value::Null) => Err(DispatchError::MissingParam("session_id")),
        Some(Value::String(id)) if id.is_empty() => Err(DispatchError::MissingParam("session_id")),
        Some(Value::String(id)) => Ok(id.clone()),
        Some(_) => Err(DispatchError::InvalidParam {
            name: "session_id",
            expected: "a string",
        }),
    }
}

struct CreateSession {
    defaults: SessionConfig,
}

#[async_trait]
impl<B: Backend> ActionHandler<B> for CreateSession {
    fn spec(&self) -> &'static ActionSpec {
        &CREATE_SESSION
    }

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let mut config = self.defaults.clone();
        match params.get("charttype") {
            None | Some(Value::Null) => {}
            Some(Value::String(charttype)) => config.charttype = charttype.clone(),
            Some(_) => {
                return Err(DispatchError::InvalidParam {
                    name: "charttype",
                    expected: "a string",
                })
            }
        }
        match params.get("turbo_mode") {
            None | Some(Value::Null) => {}
            Some(Value::Bool(turbo)) => config.turbo_mode = *turbo,
            Some(_) => {
                return Err(DispatchError::InvalidParam {
                    name: "turbo_mode",
                    expected: "a boolean",
                })
            }
        }

        let session_id = sessions.create(config.clone()).await?;
        Ok(json!({
            "session_id": session_id,
            "charttype": config.charttype,
            "turbo_mode": config.turbo_mode,
        }))
    }
}

struct GetSession;

#[async_trait]
impl<B: Backend> ActionHandler<B> for GetSession {
    fn spec(&self) -> &'static ActionSpec {
        &GET_SESSION
    }

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let id = session_id(&params)?;
        sessions.get(&id).await?;
        let info = sessions.info(&id).await?;
        Ok(json!(info))
    }
}

struct DeleteSession;

#[async_trait]
impl<B: Backend> ActionHandler<B> for DeleteSession {
    fn spec(&self) -> &'static ActionSpec {
        &DELETE_SESSION
    }

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let id = session_id(&params)?;
        sessions.delete(&id).await?;
        Ok(json!({ "message": format!("Session {} deleted", id) }))
    }
}

struct ListSessions;

#[async_trait]
impl<B: Backend> ActionHandler<B> for ListSessions {
    fn spec(&self) -> &'static ActionSpec {
        &LIST_SESSIONS
    }

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        _params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        Ok(json!({ "sessions": sessions.list().await }))
    }
}

/// Forwards a session-scoped action to the backend, minus `session_id`.
struct BackendAction {
    spec: &'static ActionSpec,
}

#[async_trait]
impl<B: Backend> ActionHandler<B> for BackendAction {
    fn spec(&self) -> &'static ActionSpec {
        self.spec
    }

    async fn handle(
        &self,
        sessions: &SessionTable<B>,
        mut params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let id = session_id(&params)?;
        params.remove("session_id");
        Ok(sessions.execute(&id, self.spec.name, params).await?)
    }
}

/// Maps action names to handlers and turns every outcome into a [`Response`].
pub struct Dispatcher<B: Backend> {
    sessions: Arc<SessionTable<B>>,
    handlers: HashMap<&'static str, Box<dyn ActionHandler<B>>>,
    capabilities: Value,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(sessions: Arc<SessionTable<B>>, defaults: SessionConfig) -> Self {
        let mut registered: Vec<Box<dyn ActionHandler<B>>> = vec![
            Box::new(CreateSession { defaults }),
            Box::new(GetSession),
            Box::new(DeleteSession),
            Box::new(ListSessions),
        ];
        registered.extend(
            BACKEND_ACTIONS
                .iter()
                .map(|spec| Box::new(BackendAction { spec }) as Box<dyn ActionHandler<B>>),
        );

        let capabilities = catalog::describe(registered.iter().map(|h| h.spec()));
        let handlers = registered.into_iter().map(|h| (h.spec().name, h)).collect();

        Self {
            sessions,
            handlers,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Always yields exactly one response; handler failures become error
    /// responses.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { action, params } = request;

        if action == GET_CAPABILITIES {
            return Response::ok(self.capabilities.clone());
        }

        let Some(handler) = self.handlers.get(action.as_str()) else {
            warn!("Unknown action: {}", action);
            return Response::error(DispatchError::UnknownAction(action).to_string());
        };

        debug!("Dispatching {}", action);
        match handler.handle(&self.sessions, params).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!("Action {} failed: {}", action, e);
                Response::error(e.to_string())
            }
        }
    }
}
