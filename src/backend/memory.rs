use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::{Backend, BackendError};
use crate::config::SessionConfig;

/// Deepest topic level a document may hold. Rendered JSON nests two levels
/// per topic, so this keeps responses inside serde_json's recursion limit on
/// the reading side and keeps every tree walk shallow.
pub const MAX_TOPIC_DEPTH: usize = 50;

/// Keeps one mind-map document per session in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for MemoryBackend {
    type Handle = MindmapDocument;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn init(&self, config: &SessionConfig) -> Result<MindmapDocument, BackendError> {
        Ok(MindmapDocument::new(config.clone()))
    }

    fn execute(
        &self,
        document: &mut MindmapDocument,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        match action {
            "get_mindmap" => document.get_mindmap(),
            "create_mindmap" => document.create_mindmap(params),
            "add_topic" => document.add_topic(params),
            "update_topic" => document.update_topic(params),
            "add_relationship" => document.add_relationship(params),
            "add_tag" => document.add_tag(params),
            "serialize_mindmap" => document.serialize(params),
            other => Err(BackendError::Call(format!("Unsupported backend action: {}", other))),
        }
    }

    fn release(&self, document: MindmapDocument) {
        debug!("Releasing in-memory document with {} topics", document.topics.len());
    }
}

#[derive(Debug, Clone, Serialize)]
struct Reference {
    guid_1: String,
    guid_2: String,
    direction: i64,
    label: String,
}

#[derive(Debug, Clone)]
struct Topic {
    guid: String,
    text: String,
    notes: Option<String>,
    tags: Vec<String>,
    references: Vec<Reference>,
    subtopics: Vec<String>,
}

impl Topic {
    fn new(guid: String, text: &str) -> Self {
        Self {
            guid,
            text: text.to_string(),
            notes: None,
            tags: Vec::new(),
            references: Vec::new(),
            subtopics: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct MindmapDocument {
    config: SessionConfig,
    central: Option<String>,
    topics: HashMap<String, Topic>,
}

fn new_guid() -> String {
    Uuid::new_v4().to_string()
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn message(text: &str) -> Value {
    json!({ "message": text })
}

fn too_deep() -> BackendError {
    BackendError::Call(format!(
        "Mindmap too deep: topics may nest at most {} levels",
        MAX_TOPIC_DEPTH
    ))
}

/// Pre-order walk from `root` with an explicit stack. `path` mirrors the
/// guids from the root down to the current topic so a guid met again on
/// the same branch is skipped.
fn walk_outline<'a>(root: &'a str, topics: &'a HashMap<String, Topic>) -> Vec<(usize, &'a Topic)> {
    let mut out = Vec::new();
    let mut path: Vec<&str> = Vec::new();
    let mut on_path: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(usize, &str)> = vec![(0, root)];

    while let Some((level, guid)) = stack.pop() {
        while path.len() > level {
            if let Some(done) = path.pop() {
                on_path.remove(done);
            }
        }
        let Some(topic) = topics.get(guid) else { continue };
        if on_path.contains(guid) {
            continue;
        }
        out.push((level, topic));
        path.push(guid);
        on_path.insert(guid);
        for child in topic.subtopics.iter().rev() {
            stack.push((level + 1, child.as_str()));
        }
    }
    out
}

impl MindmapDocument {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            central: None,
            topics: HashMap::new(),
        }
    }

    fn central_guid(&self) -> Result<&str, BackendError> {
        self.central
            .as_deref()
            .ok_or_else(|| BackendError::Call("No mindmap document is open".into()))
    }

    fn topic_mut(&mut self, guid: &str) -> Result<&mut Topic, BackendError> {
        self.topics
            .get_mut(guid)
            .ok_or_else(|| BackendError::Call(format!("Topic not found with GUID: {}", guid)))
    }

    fn get_mindmap(&self) -> Result<Value, BackendError> {
        let central = self.central_guid()?;
        let max_topic_level = self.outline().iter().map(|(level, _)| *level).max().unwrap_or(0);
        Ok(json!({
            "mindmap": self.topic_json(central, 0, &mut HashSet::new()),
            "max_topic_level": max_topic_level,
            "selected_topics": [],
            "central_topic_selected": false,
            "charttype": self.config.charttype,
        }))
    }

    fn create_mindmap(&mut self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let central_text = str_param(params, "central_topic").unwrap_or("Central Topic");
        let central_guid = new_guid();

        let mut topics = HashMap::new();
        topics.insert(central_guid.clone(), Topic::new(central_guid.clone(), central_text));

        let entries = match params.get("topics") {
            None | Some(Value::Null) => &[] as &[Value],
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(_) => return Err(BackendError::Call("topics must be an array".into())),
        };

        // Topics may name parents that appear later in the list, so create
        // everything before linking.
        let mut links = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(entry) = entry.as_object() else {
                return Err(BackendError::Call("Each topic must be an object".into()));
            };
            let text = str_param(entry, "text")
                .ok_or_else(|| BackendError::Call("Each topic needs a text".into()))?;
            let guid = str_param(entry, "guid").map(str::to_string).unwrap_or_else(new_guid);
            if topics.contains_key(&guid) {
                return Err(BackendError::Call(format!("Duplicate topic GUID: {}", guid)));
            }

            let mut topic = Topic::new(guid.clone(), text);
            topic.notes = str_param(entry, "notes").map(str::to_string);
            links.push((guid.clone(), str_param(entry, "parent_guid").map(str::to_string)));
            topics.insert(guid, topic);
        }

        for (guid, parent) in links {
            let parent = parent.unwrap_or_else(|| central_guid.clone());
            match topics.get_mut(&parent) {
                Some(parent) => parent.subtopics.push(guid),
                None => debug!("Dropping topic {} with unknown parent {}", guid, parent),
            }
        }

        if let Some(Value::Array(relationships)) = params.get("relationships") {
            for rel in relationships.iter().filter_map(Value::as_object) {
                let (Some(guid_1), Some(guid_2)) =
                    (str_param(rel, "guid_1"), str_param(rel, "guid_2"))
                else {
                    continue;
                };
                if !topics.contains_key(guid_2) {
                    continue;
                }
                if let Some(topic) = topics.get_mut(guid_1) {
                    topic.references.push(Reference {
                        guid_1: guid_1.to_string(),
                        guid_2: guid_2.to_string(),
                        direction: rel.get("direction").and_then(Value::as_i64).unwrap_or(1),
                        label: str_param(rel, "label").unwrap_or_default().to_string(),
                    });
                }
            }
        }

        let outline = walk_outline(&central_guid, &topics);
        let depth = outline.iter().map(|(level, _)| *level).max().unwrap_or(0);
        if depth > MAX_TOPIC_DEPTH {
            return Err(too_deep());
        }
        let reachable: HashSet<String> = outline.into_iter().map(|(_, t)| t.guid.clone()).collect();
        topics.retain(|guid, _| reachable.contains(guid));

        self.central = Some(central_guid.clone());
        self.topics = topics;

        Ok(json!({
            "message": "Mindmap created successfully",
            "central_topic_guid": central_guid,
        }))
    }

    fn add_topic(&mut self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let text = str_param(params, "text")
            .ok_or_else(|| BackendError::Call("text is required".into()))?
            .to_string();
        let parent_guid = match str_param(params, "parent_guid") {
            Some(guid) => guid.to_string(),
            None => self.central_guid()?.to_string(),
        };
        if self.central.is_none() {
            return Err(BackendError::Call("No mindmap document is open".into()));
        }

        let parent_level = self
            .outline()
            .iter()
            .find(|(_, topic)| topic.guid == parent_guid)
            .map(|(level, _)| *level)
            .ok_or_else(|| BackendError::Call("Parent topic not found".into()))?;
        if parent_level + 1 > MAX_TOPIC_DEPTH {
            return Err(too_deep());
        }

        let guid = new_guid();
        let parent = self
            .topics
            .get_mut(&parent_guid)
            .ok_or_else(|| BackendError::Call("Parent topic not found".into()))?;
        parent.subtopics.push(guid.clone());

        let mut topic = Topic::new(guid.clone(), &text);
        topic.notes = str_param(params, "notes").map(str::to_string);
        self.topics.insert(guid.clone(), topic);

        Ok(json!({ "guid": guid, "text": text }))
    }

    fn update_topic(&mut self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let guid = str_param(params, "guid")
            .ok_or_else(|| BackendError::Call("Topic GUID is required for updates".into()))?;
        let topic = self.topic_mut(guid)?;

        if let Some(text) = str_param(params, "text") {
            topic.text = text.to_string();
        }
        // An explicit empty string clears the notes.
        if let Some(notes) = params.get("notes").and_then(Value::as_str) {
            topic.notes = (!notes.is_empty()).then(|| notes.to_string());
        }

        Ok(message("Topic updated successfully"))
    }

    fn add_relationship(&mut self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let (Some(guid_1), Some(guid_2)) =
            (str_param(params, "guid_1"), str_param(params, "guid_2"))
        else {
            return Err(BackendError::Call("Both guid_1 and guid_2 are required".into()));
        };
        self.topic_mut(guid_2)?;

        let reference = Reference {
            guid_1: guid_1.to_string(),
            guid_2: guid_2.to_string(),
            direction: params.get("direction").and_then(Value::as_i64).unwrap_or(1),
            label: str_param(params, "label").unwrap_or_default().to_string(),
        };
        self.topic_mut(guid_1)?.references.push(reference);

        Ok(message("Relationship added successfully"))
    }

    fn add_tag(&mut self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let (Some(topic_guid), Some(tag_text)) =
            (str_param(params, "topic_guid"), str_param(params, "tag_text"))
        else {
            return Err(BackendError::Call("Both topic_guid and tag_text are required".into()));
        };
        let topic = self.topic_mut(topic_guid)?;
        if !topic.tags.iter().any(|t| t == tag_text) {
            topic.tags.push(tag_text.to_string());
        }
        Ok(message("Tag added successfully"))
    }

    fn serialize(&self, params: &Map<String, Value>) -> Result<Value, BackendError> {
        let format = str_param(params, "format_type").unwrap_or("mermaid");
        let central = self.central_guid()?;

        let content = match format {
            "json" => self.topic_json(central, 0, &mut HashSet::new()),
            "markdown" => Value::String(self.to_markdown()),
            "mermaid" => Value::String(self.to_mermaid()),
            other => return Err(BackendError::Call(format!("Unsupported format type: {}", other))),
        };
        Ok(json!({ "format": format, "content": content }))
    }

    /// `path` holds the guids on the way down from the root; a guid met again
    /// on the same branch is emitted as a stub instead of recursing.
    fn topic_json(&self, guid: &str, level: usize, path: &mut HashSet<String>) -> Value {
        let Some(topic) = self.topics.get(guid) else {
            return json!({ "guid": guid, "missing": true });
        };
        if path.contains(guid) {
            return json!({
                "guid": topic.guid,
                "text": topic.text,
                "level": level,
                "visited_reference": true,
            });
        }
        path.insert(guid.to_string());

        let mut out = Map::new();
        out.insert("guid".into(), json!(topic.guid));
        out.insert("text".into(), json!(topic.text));
        out.insert("level".into(), json!(level));
        if let Some(notes) = &topic.notes {
            out.insert("notes".into(), json!(notes));
        }
        if !topic.tags.is_empty() {
            out.insert("tags".into(), json!(topic.tags));
        }
        if !topic.references.is_empty() {
            out.insert("references".into(), json!(topic.references));
        }
        if !topic.subtopics.is_empty() {
            let subtopics: Vec<Value> = topic
                .subtopics
                .iter()
                .map(|child| self.topic_json(child, level + 1, path))
                .collect();
            out.insert("subtopics".into(), Value::Array(subtopics));
        }

        path.remove(guid);
        Value::Object(out)
    }

    /// Depth-first (level, topic) listing, skipping revisits on a branch.
    fn outline(&self) -> Vec<(usize, &Topic)> {
        match &self.central {
            Some(central) => walk_outline(central, &self.topics),
            None => Vec::new(),
        }
    }

    fn to_markdown(&self) -> String {
        let mut md = String::new();
        for (level, topic) in self.outline() {
            let indent = match level {
                0 => {
                    md.push_str(&format!("# {}\n", topic.text));
                    String::new()
                }
                1 => {
                    md.push_str(&format!("\n## {}\n", topic.text));
                    String::new()
                }
                n => {
                    let indent = "  ".repeat(n - 2);
                    md.push_str(&format!("{}- {}\n", indent, topic.text));
                    format!("{}  ", indent)
                }
            };
            if let Some(notes) = &topic.notes {
                md.push_str(&format!("{}{}\n", indent, notes));
            }
        }
        md
    }

    fn to_mermaid(&self) -> String {
        let label = |text: &str| -> String {
            text.chars()
                .map(|c| if "()[]{}\n\r".contains(c) { ' ' } else { c })
                .collect::<String>()
                .trim()
                .to_string()
        };

        let mut out = String::from("mindmap\n");
        for (level, topic) in self.outline() {
            let indent = "  ".repeat(level + 1);
            if level == 0 {
                out.push_str(&format!("{}root(({}))\n", indent, label(&topic.text)));
            } else {
                out.push_str(&format!("{}{}\n", indent, label(&topic.text)));
            }
        }
        out
    }
}
