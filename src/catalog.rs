//! Static description of every action the server answers to.
//!
//! The dispatcher registers one handler per entry here and builds the
//! `get_capabilities` descriptor from the same entries.

use serde_json::{json, Map, Value};

use crate::protocol::{SERVICE_DESCRIPTION, SERVICE_DISPLAY_NAME, SERVICE_NAME, SERVICE_VERSION};

#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: &'static [Param],
    pub returns: &'static [Field],
}

const fn param(
    name: &'static str,
    kind: &'static str,
    description: &'static str,
    required: bool,
) -> Param {
    Param { name, kind, description, required }
}

const fn field(name: &'static str, kind: &'static str, description: &'static str) -> Field {
    Field { name, kind, description }
}

const SESSION_ID: Param = param("session_id", "string", "Session returned by create_session", true);
const MESSAGE: Field = field("message", "string", "Status message");

pub static CREATE_SESSION: ActionSpec = ActionSpec {
    name: "create_session",
    description: "Open a new MindManager session",
    parameters: &[
        param("charttype", "string", "Chart type (auto, radial, orgchart)", false),
        param("turbo_mode", "boolean", "Enable turbo mode for faster processing", false),
    ],
    returns: &[
        field("session_id", "string", "Identifier to pass to session-scoped actions"),
        field("charttype", "string", "Chart type of the session"),
        field("turbo_mode", "boolean", "Whether turbo mode is enabled"),
    ],
};

pub static GET_SESSION: ActionSpec = ActionSpec {
    name: "get_session",
    description: "Get information about an active session",
    parameters: &[SESSION_ID],
    returns: &[
        field("session_id", "string", "Session identifier"),
        field("charttype", "string", "Chart type of the session"),
        field("turbo_mode", "boolean", "Whether turbo mode is enabled"),
        field("idle_seconds", "integer", "Seconds since the session was last used"),
    ],
};

pub static DELETE_SESSION: ActionSpec = ActionSpec {
    name: "delete_session",
    description: "Close a session and release its document",
    parameters: &[SESSION_ID],
    returns: &[MESSAGE],
};

pub static LIST_SESSIONS: ActionSpec = ActionSpec {
    name: "list_sessions",
    description: "List active sessions",
    parameters: &[],
    returns: &[field("sessions", "array", "Active sessions")],
};

/// Session-scoped actions forwarded to the backend as-is.
pub static BACKEND_ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "get_mindmap",
        description: "Get the current mindmap from MindManager",
        parameters: &[SESSION_ID],
        returns: &[
            field("mindmap", "object", "The current mindmap structure"),
            field("max_topic_level", "integer", "The maximum topic level in the mindmap"),
            field("selected_topics", "array", "List of currently selected topics"),
            field("central_topic_selected", "boolean", "Whether the central topic is selected"),
        ],
    },
    ActionSpec {
        name: "create_mindmap",
        description: "Create a new mindmap",
        parameters: &[
            SESSION_ID,
            param("central_topic", "string", "The central topic text", true),
            param("topics", "array", "List of topics to add", false),
            param("relationships", "array", "List of relationships between topics", false),
        ],
        returns: &[MESSAGE],
    },
    ActionSpec {
        name: "add_topic",
        description: "Add a topic to the mindmap",
        parameters: &[
            SESSION_ID,
            param("text", "string", "The topic text", true),
            param("parent_guid", "string", "GUID of the parent topic", false),
            param("notes", "string", "Notes for the topic", false),
        ],
        returns: &[
            field("guid", "string", "GUID of the created topic"),
            field("text", "string", "Text of the created topic"),
        ],
    },
    ActionSpec {
        name: "update_topic",
        description: "Update an existing topic",
        parameters: &[
            SESSION_ID,
            param("guid", "string", "GUID of the topic to update", true),
            param("text", "string", "New topic text", false),
            param("notes", "string", "New notes for the topic", false),
        ],
        returns: &[MESSAGE],
    },
    ActionSpec {
        name: "add_relationship",
        description: "Add a relationship between topics",
        parameters: &[
            SESSION_ID,
            param("guid_1", "string", "GUID of the first topic", true),
            param("guid_2", "string", "GUID of the second topic", true),
            param("label", "string", "Label for the relationship", false),
        ],
        returns: &[MESSAGE],
    },
    ActionSpec {
        name: "add_tag",
        description: "Add a tag to a topic",
        parameters: &[
            SESSION_ID,
            param("topic_guid", "string", "GUID of the topic", true),
            param("tag_text", "string", "Tag text", true),
        ],
        returns: &[MESSAGE],
    },
    ActionSpec {
        name: "serialize_mindmap",
        description: "Serialize the mindmap to a specified format",
        parameters: &[
            SESSION_ID,
            param(
                "format_type",
                "string",
                "Format to serialize to (mermaid, markdown, json)",
                false,
            ),
        ],
        returns: &[
            field("format", "string", "The format of the serialized mindmap"),
            field("content", "string", "The serialized mindmap content"),
        ],
    },
];

/// Build the `get_capabilities` payload for the given actions.
pub fn describe<'a>(actions: impl IntoIterator<Item = &'a ActionSpec>) -> Value {
    let actions: Vec<Value> = actions
        .into_iter()
        .map(|spec| {
            let parameters: Map<String, Value> = spec
                .parameters
                .iter()
                .map(|p| {
                    let schema = json!({
                        "description": p.description,
                        "type": p.kind,
                        "required": p.required,
                    });
                    (p.name.to_string(), schema)
                })
                .collect();
            let returns: Map<String, Value> = spec
                .returns
                .iter()
                .map(|f| {
                    let schema = json!({ "description": f.description, "type": f.kind });
                    (f.name.to_string(), schema)
                })
                .collect();
            json!({
                "name": spec.name,
                "description": spec.description,
                "parameters": parameters,
                "returns": returns,
            })
        })
        .collect();

    json!({
        "name": SERVICE_NAME,
        "display_name": SERVICE_DISPLAY_NAME,
        "description": SERVICE_DESCRIPTION,
        "version": SERVICE_VERSION,
        "actions": actions,
    })
}
