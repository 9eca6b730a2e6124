// Schemas - field rules, lifecycle hooks, virtuals, methods and statics

pub mod parser;
pub mod types;

pub use parser::{parse_schema, parse_schema_str, parse_schema_value};
pub use types::{
    DefaultValue, FieldDefinition, FieldRule, FieldType, Generator, IndexSpec, Predicate,
    Required, SchemaDefinition,
};

use crate::document::{Document, ID_FIELD};
use crate::error::{NestDbError, Result};
use crate::index::IndexOptions;
use crate::model::{Model, ModelDocument};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle actions hooks attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookAction {
    Save,
    Delete,
}

pub type PreHookFn = Arc<dyn Fn(&mut Document) -> Result<()> + Send + Sync>;
pub type PostHookFn = Arc<dyn Fn(&Document) -> Result<()> + Send + Sync>;
pub type MethodFn = Arc<dyn Fn(&mut ModelDocument, &[Value]) -> Result<Value> + Send + Sync>;
pub type StaticFn = Arc<dyn Fn(&Model, &[Value]) -> Result<Value> + Send + Sync>;
pub type VirtualGetter = Arc<dyn Fn(&Document) -> Value + Send + Sync>;
pub type VirtualSetter = Arc<dyn Fn(&mut Document, Value) -> Result<()> + Send + Sync>;

/// A named callback registered for one action.
#[derive(Clone)]
pub struct Hook<F> {
    pub action: HookAction,
    pub name: String,
    pub run: F,
}

/// Ordered pre- and post-hooks. Hooks run strictly in registration order and
/// the first failure stops the pipeline.
#[derive(Clone, Default)]
pub struct HookPipeline {
    pre: Vec<Hook<PreHookFn>>,
    post: Vec<Hook<PostHookFn>>,
}

impl HookPipeline {
    pub fn add_pre(&mut self, action: HookAction, name: impl Into<String>, run: PreHookFn) {
        self.pre.push(Hook {
            action,
            name: name.into(),
            run,
        });
    }

    pub fn add_post(&mut self, action: HookAction, name: impl Into<String>, run: PostHookFn) {
        self.post.push(Hook {
            action,
            name: name.into(),
            run,
        });
    }

    pub fn run_pre(&self, action: HookAction, doc: &mut Document) -> Result<()> {
        for hook in self.pre.iter().filter(|h| h.action == action) {
            log::trace!("Running pre-{action:?} hook '{}'", hook.name);
            (hook.run)(doc).map_err(|e| hook_error(&hook.name, e))?;
        }
        Ok(())
    }

    pub fn run_post(&self, action: HookAction, doc: &Document) -> Result<()> {
        for hook in self.post.iter().filter(|h| h.action == action) {
            log::trace!("Running post-{action:?} hook '{}'", hook.name);
            (hook.run)(doc).map_err(|e| hook_error(&hook.name, e))?;
        }
        Ok(())
    }

    /// Names of the pre-hooks for `action`, in run order.
    pub fn pre_names(&self, action: HookAction) -> Vec<&str> {
        self.pre
            .iter()
            .filter(|h| h.action == action)
            .map(|h| h.name.as_str())
            .collect()
    }

    pub fn post_names(&self, action: HookAction) -> Vec<&str> {
        self.post
            .iter()
            .filter(|h| h.action == action)
            .map(|h| h.name.as_str())
            .collect()
    }
}

fn hook_error(name: &str, error: NestDbError) -> NestDbError {
    match error {
        NestDbError::Hook { .. } => error,
        other => NestDbError::Hook {
            hook: name.to_string(),
            message: other.to_string(),
        },
    }
}

/// A computed property: read through a getter, optionally written through a
/// setter that maps the value onto real fields.
#[derive(Clone)]
pub struct Virtual {
    getter: Option<VirtualGetter>,
    setter: Option<VirtualSetter>,
}

impl Virtual {
    pub fn getter(get: impl Fn(&Document) -> Value + Send + Sync + 'static) -> Self {
        Virtual {
            getter: Some(Arc::new(get)),
            setter: None,
        }
    }

    pub fn setter(set: impl Fn(&mut Document, Value) -> Result<()> + Send + Sync + 'static) -> Self {
        Virtual {
            getter: None,
            setter: Some(Arc::new(set)),
        }
    }

    pub fn with_setter(
        mut self,
        set: impl Fn(&mut Document, Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(set));
        self
    }

    pub fn get(&self, doc: &Document) -> Option<Value> {
        self.getter.as_ref().map(|get| get(doc))
    }

    pub fn set(&self, doc: &mut Document, value: Value) -> Option<Result<()>> {
        self.setter.as_ref().map(|set| set(doc, value))
    }
}

/// Everything a model knows about its documents. Built once, then shared.
#[derive(Clone, Default)]
pub struct Schema {
    fields: Vec<(String, FieldRule)>,
    hooks: HookPipeline,
    virtuals: Vec<(String, Virtual)>,
    methods: HashMap<String, MethodFn>,
    statics: HashMap<String, StaticFn>,
    indexes: Vec<IndexSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a declarative schema (field rules and index specs only).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        parse_schema_str(content)
    }

    pub fn from_json_value(value: &Value) -> Result<Self> {
        parse_schema_value(value)
    }

    /// Add or replace the rule for `name` (a dot path for nested fields).
    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = rule,
            None => self.fields.push((name, rule)),
        }
        self
    }

    pub fn pre(
        mut self,
        action: HookAction,
        name: impl Into<String>,
        run: impl Fn(&mut Document) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.add_pre(action, name, Arc::new(run));
        self
    }

    pub fn post(
        mut self,
        action: HookAction,
        name: impl Into<String>,
        run: impl Fn(&Document) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.add_post(action, name, Arc::new(run));
        self
    }

    pub fn virtual_field(mut self, name: impl Into<String>, property: Virtual) -> Self {
        self.virtuals.push((name.into(), property));
        self
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        run: impl Fn(&mut ModelDocument, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Arc::new(run));
        self
    }

    pub fn static_fn(
        mut self,
        name: impl Into<String>,
        run: impl Fn(&Model, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.statics.insert(name.into(), Arc::new(run));
        self
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    pub fn fields(&self) -> &[(String, FieldRule)] {
        &self.fields
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn virtuals(&self) -> &[(String, Virtual)] {
        &self.virtuals
    }

    pub fn get_virtual(&self, name: &str) -> Option<&Virtual> {
        self.virtuals.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_method(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }

    pub fn get_static(&self, name: &str) -> Option<&StaticFn> {
        self.statics.get(name)
    }

    pub fn index_specs(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Indexes a model must create, one per field. A field listed both as
    /// unique and plain gets a unique index.
    pub fn index_plan(&self) -> Result<Vec<(String, IndexOptions)>> {
        let mut plan: Vec<(String, IndexOptions)> = Vec::new();
        let mut add = |field: &str, unique: bool| {
            if field == ID_FIELD {
                return;
            }
            match plan.iter_mut().find(|(f, _)| f == field) {
                Some((_, options)) => options.unique |= unique,
                None => plan.push((field.to_string(), IndexOptions { unique })),
            }
        };

        for (name, rule) in &self.fields {
            if rule.unique || rule.index {
                add(name, rule.unique);
            }
        }
        for spec in &self.indexes {
            if spec.fields.is_empty() {
                return Err(NestDbError::Schema("index spec without fields".to_string()));
            }
            if spec.unique && spec.fields.len() > 1 {
                return Err(NestDbError::Schema(format!(
                    "unique compound indexes are not supported: {}",
                    spec.fields.join(", ")
                )));
            }
            for field in &spec.fields {
                add(field, spec.unique);
            }
        }
        Ok(plan)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        let mut statics: Vec<&String> = self.statics.keys().collect();
        statics.sort();
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("virtuals", &self.virtuals.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("methods", &methods)
            .field("statics", &statics)
            .field("indexes", &self.indexes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&calls), Arc::clone(&calls), Arc::clone(&calls));
        let schema = Schema::new()
            .pre(HookAction::Save, "first", move |_| {
                a.lock().unwrap().push("first");
                Ok(())
            })
            .pre(HookAction::Delete, "other", |_| Ok(()))
            .pre(HookAction::Save, "second", move |doc| {
                b.lock().unwrap().push("second");
                doc.insert("touched".into(), json!(true));
                Ok(())
            })
            .post(HookAction::Save, "after", move |_| {
                c.lock().unwrap().push("after");
                Ok(())
            });

        let mut doc = Document::new();
        schema.hooks().run_pre(HookAction::Save, &mut doc).unwrap();
        schema.hooks().run_post(HookAction::Save, &doc).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "after"]);
        assert_eq!(doc["touched"], json!(true));
        assert_eq!(schema.hooks().pre_names(HookAction::Save), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_hook_stops_pipeline() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let schema = Schema::new()
            .pre(HookAction::Save, "guard", |_| {
                Err(NestDbError::Other("not allowed".into()))
            })
            .pre(HookAction::Save, "later", move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            });

        let err = schema
            .hooks()
            .run_pre(HookAction::Save, &mut Document::new())
            .unwrap_err();
        assert!(matches!(err, NestDbError::Hook { ref hook, .. } if hook == "guard"));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn test_index_plan() {
        let schema = Schema::new()
            .field("email", FieldRule::string().unique())
            .field("role", FieldRule::string().index())
            .index(IndexSpec::new(["role", "createdAt"]))
            .index(IndexSpec::new(["_id"]));
        let plan = schema.index_plan().unwrap();
        assert_eq!(
            plan,
            vec![
                ("email".to_string(), IndexOptions { unique: true }),
                ("role".to_string(), IndexOptions { unique: false }),
                ("createdAt".to_string(), IndexOptions { unique: false }),
            ]
        );

        let schema = Schema::new().index(IndexSpec::new(["a", "b"]).unique());
        assert!(matches!(schema.index_plan(), Err(NestDbError::Schema(_))));
    }

    #[test]
    fn test_field_replaces_existing_rule() {
        let schema = Schema::new()
            .field("age", FieldRule::string())
            .field("age", FieldRule::number());
        assert_eq!(schema.fields().len(), 1);
        assert_eq!(schema.rule("age").unwrap().field_type, FieldType::Number);
    }

    #[test]
    fn test_schema_from_yaml() {
        let schema = Schema::from_yaml_str(
            r#"
fields:
  name: { type: string, required: true, trim: true, max_length: 40 }
  email: { type: string, unique: true, lowercase: true, pattern: "^[^@]+@[^@]+$" }
  role: { type: string, enum: [admin, member], default: member }
  owner: { type: objectid }
indexes:
  - fields: [role]
"#,
        )
        .unwrap();
        assert_eq!(schema.fields().len(), 4);
        let name = schema.rule("name").unwrap();
        assert!(matches!(name.required, Required::Yes));
        assert_eq!(name.max_length, Some(40));
        assert_eq!(schema.rule("owner").unwrap().field_type, FieldType::ObjectId);
        assert_eq!(
            schema.rule("role").unwrap().default.as_ref().map(DefaultValue::produce),
            Some(json!("member"))
        );
        assert_eq!(schema.index_specs().len(), 1);
    }

    #[test]
    fn test_schema_from_json_rejects_bad_pattern() {
        let err = Schema::from_json_value(&json!({
            "fields": { "code": { "type": "string", "pattern": "([" } }
        }))
        .unwrap_err();
        assert!(matches!(err, NestDbError::Schema(_)));
        assert!(Schema::from_json_value(&json!({ "fields": { "x": { "type": "uuid" } } })).is_err());
    }

    #[test]
    fn test_virtual_getter_and_setter() {
        let full_name = Virtual::getter(|doc| {
            json!(format!(
                "{} {}",
                doc["first"].as_str().unwrap_or_default(),
                doc["last"].as_str().unwrap_or_default()
            ))
        })
        .with_setter(|doc, value| {
            let text = value.as_str().unwrap_or_default().to_string();
            let (first, last) = text.split_once(' ').unwrap_or((text.as_str(), ""));
            doc.insert("first".into(), json!(first));
            doc.insert("last".into(), json!(last));
            Ok(())
        });

        let mut doc = Document::new();
        full_name.set(&mut doc, json!("Ada Lovelace")).unwrap().unwrap();
        assert_eq!(doc["last"], json!("Lovelace"));
        assert_eq!(full_name.get(&doc), Some(json!("Ada Lovelace")));
    }
}
