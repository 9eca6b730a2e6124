// Models - a schema bound to a collection, and the documents it hands out

use crate::document::{document_id, get_field, into_document, set_field, Document, ID_FIELD};
use crate::error::{NestDbError, Result};
use crate::query::{Filter, FindOptions};
use crate::schema::{HookAction, Schema};
use crate::store::{Collection, Store, UpdateResult};
use crate::update::Update;
use crate::validation;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

struct ModelInner {
    name: String,
    schema: Schema,
    collection: Collection,
}

/// A named binding of a schema to a collection. Cheap to clone.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    /// Bind `schema` to the collection `name`, creating the indexes the
    /// schema declares.
    pub fn new(store: &Store, name: &str, schema: Schema) -> Result<Model> {
        let collection = store.collection(name)?;
        for (field, options) in schema.index_plan()? {
            store.create_index(name, &field, options)?;
        }
        log::debug!(
            "Model '{name}' bound with {} fields and {} indexes",
            schema.fields().len(),
            store.list_indexes(name).len()
        );
        Ok(Model {
            inner: Arc::new(ModelInner {
                name: name.to_string(),
                schema,
                collection,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn collection(&self) -> &Collection {
        &self.inner.collection
    }

    fn wrap(&self, data: Document) -> ModelDocument {
        ModelDocument {
            model: self.clone(),
            data,
        }
    }

    fn wrap_all(&self, docs: Vec<Document>) -> Vec<ModelDocument> {
        docs.into_iter().map(|d| self.wrap(d)).collect()
    }

    /// Defaults, transforms, pre-save hooks, validation, insert, post-save
    /// hooks.
    pub fn create(&self, data: Value) -> Result<ModelDocument> {
        let schema = self.schema();
        let mut doc = into_document(data)?;
        validation::apply_defaults(schema, &mut doc)?;
        validation::apply_transforms(schema, &mut doc)?;
        schema.hooks().run_pre(HookAction::Save, &mut doc)?;
        validation::ensure_valid(schema, &doc)?;

        let stored = self.collection().insert_one(Value::Object(doc))?;
        schema.hooks().run_post(HookAction::Save, &stored)?;
        Ok(self.wrap(stored))
    }

    /// Create each element in turn; stops at the first failure, keeping the
    /// documents created before it.
    pub fn create_many(&self, items: Vec<Value>) -> Result<Vec<ModelDocument>> {
        items.into_iter().map(|item| self.create(item)).collect()
    }

    pub fn find(&self, filter: &Value, options: &FindOptions) -> Result<Vec<ModelDocument>> {
        Ok(self.wrap_all(self.collection().find(filter, options)?))
    }

    pub fn find_one(&self, filter: &Value) -> Result<Option<ModelDocument>> {
        Ok(self.collection().find_one(filter)?.map(|d| self.wrap(d)))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<ModelDocument>> {
        Ok(self.collection().find_by_id(id)?.map(|d| self.wrap(d)))
    }

    pub fn find_by_id_and_update(&self, id: &str, update: &Value) -> Result<Option<ModelDocument>> {
        let update = Update::parse(update)?;
        let (_, mut after) = self.checked_update(&Filter::by_id(id), &update, false)?;
        Ok(after.pop().map(|d| self.wrap(d)))
    }

    /// Delete by id, running delete hooks around the removal.
    pub fn find_by_id_and_delete(&self, id: &str) -> Result<Option<ModelDocument>> {
        let Some(found) = self.collection().find_by_id(id)? else {
            return Ok(None);
        };
        self.remove_document(found)
            .map(|removed| removed.map(|d| self.wrap(d)))
    }

    pub fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let (result, _) =
            self.checked_update(&Filter::parse(filter)?, &Update::parse(update)?, false)?;
        Ok(result)
    }

    pub fn update_many(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let (result, _) =
            self.checked_update(&Filter::parse(filter)?, &Update::parse(update)?, true)?;
        Ok(result)
    }

    pub fn delete_one(&self, filter: &Value) -> Result<usize> {
        self.collection().delete_one(filter)
    }

    pub fn delete_many(&self, filter: &Value) -> Result<usize> {
        self.collection().delete_many(filter)
    }

    pub fn count_documents(&self, filter: &Value) -> Result<usize> {
        self.collection().count_documents(filter)
    }

    pub fn exists(&self, filter: &Value) -> Result<bool> {
        self.collection().exists(filter)
    }

    pub fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        self.collection().distinct(field, filter)
    }

    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Document>> {
        self.collection().aggregate(pipeline)
    }

    /// Invoke a static function registered on the schema.
    pub fn call_static(&self, name: &str, args: &[Value]) -> Result<Value> {
        let function = self.schema().get_static(name).cloned().ok_or_else(|| {
            NestDbError::Schema(format!("model '{}' has no static '{name}'", self.name()))
        })?;
        function(self, args)
    }

    /// Updates through a model are validated document by document before
    /// anything is committed.
    fn checked_update(
        &self,
        filter: &Filter,
        update: &Update,
        many: bool,
    ) -> Result<(UpdateResult, Vec<Document>)> {
        let schema = self.schema();
        self.collection()
            .update_matching(filter, update, many, &|doc| validation::ensure_valid(schema, doc))
    }

    fn remove_document(&self, doc: Document) -> Result<Option<Document>> {
        let hooks = self.schema().hooks();
        let mut doc = doc;
        hooks.run_pre(HookAction::Delete, &mut doc)?;
        let id = document_id(&doc).unwrap_or_default().to_string();
        let mut removed = self.collection().delete_matching(&Filter::by_id(&id), false)?;
        let Some(removed) = removed.pop() else {
            return Ok(None);
        };
        hooks.run_post(HookAction::Delete, &removed)?;
        Ok(Some(removed))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("schema", &self.inner.schema)
            .finish()
    }
}

/// A document bound to its model.
#[derive(Clone)]
pub struct ModelDocument {
    model: Model,
    data: Document,
}

impl ModelDocument {
    pub fn id(&self) -> &str {
        document_id(&self.data).unwrap_or_default()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Stored field at `path`, or the value of a virtual with that name.
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(value) = get_field(&self.data, path) {
            return Some(value.clone());
        }
        self.model.schema().get_virtual(path)?.get(&self.data)
    }

    /// Set a field locally; nothing is stored until [`save`](Self::save).
    /// Virtuals with a setter take the value instead of a real field.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if let Some(property) = self.model.schema().get_virtual(path) {
            if let Some(result) = property.set(&mut self.data, value.clone()) {
                return result;
            }
        }
        if path == ID_FIELD {
            return Err(NestDbError::InvalidUpdate(format!(
                "cannot modify '{ID_FIELD}'"
            )));
        }
        set_field(&mut self.data, path, value)
    }

    /// Invoke an instance method registered on the schema.
    pub fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let function = self.model.schema().get_method(method).cloned().ok_or_else(|| {
            NestDbError::Schema(format!(
                "model '{}' has no method '{method}'",
                self.model.name()
            ))
        })?;
        function(self, args)
    }

    /// Persist local changes: transforms, pre-save hooks, validation, a
    /// whole-document `$set`, then post-save hooks. The local copy is
    /// refreshed from the stored result.
    pub fn save(&mut self) -> Result<()> {
        let schema = self.model.schema();
        let mut doc = self.data.clone();
        validation::apply_transforms(schema, &mut doc)?;
        schema.hooks().run_pre(HookAction::Save, &mut doc)?;
        validation::ensure_valid(schema, &doc)?;

        let id = self.id().to_string();
        let (result, mut after) = self.model.checked_update(
            &Filter::by_id(&id),
            &Update::replace_fields(&doc),
            false,
        )?;
        let stored = match after.pop() {
            Some(stored) if result.matched > 0 => stored,
            _ => {
                return Err(NestDbError::NotFound {
                    collection: self.model.name().to_string(),
                    id,
                })
            }
        };
        schema.hooks().run_post(HookAction::Save, &stored)?;
        self.data = stored;
        Ok(())
    }

    /// Delete this document, running delete hooks. Returns whether it was
    /// still stored.
    pub fn remove(&self) -> Result<bool> {
        Ok(self.model.remove_document(self.data.clone())?.is_some())
    }

    /// Plain data without virtuals.
    pub fn to_object(&self) -> Document {
        self.data.clone()
    }

    pub fn to_object_with_virtuals(&self) -> Document {
        let mut data = self.data.clone();
        for (name, property) in self.model.schema().virtuals() {
            if let Some(value) = property.get(&self.data) {
                data.insert(name.clone(), value);
            }
        }
        data
    }

    pub fn as_document(&self) -> &Document {
        &self.data
    }
}

impl Serialize for ModelDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl fmt::Debug for ModelDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDocument")
            .field("model", &self.model.name())
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldRule, IndexSpec, Virtual};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn user_schema() -> Schema {
        Schema::new()
            .field("name", FieldRule::string().required().trim())
            .field("email", FieldRule::string().required().lowercase().unique())
            .field(
                "role",
                FieldRule::string()
                    .enum_values(["admin", "member"])
                    .default_value("member"),
            )
            .field("age", FieldRule::number().min(0.0))
            .field("logins", FieldRule::number().default_value(0))
            .virtual_field(
                "label",
                Virtual::getter(|doc| {
                    json!(format!(
                        "{} <{}>",
                        doc["name"].as_str().unwrap_or_default(),
                        doc["email"].as_str().unwrap_or_default()
                    ))
                }),
            )
            .method("login", |doc, _args| {
                let logins = doc.get("logins").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                doc.set("logins", logins)?;
                doc.save()?;
                Ok(json!(logins))
            })
            .static_fn("admins", |model, _args| {
                Ok(json!(model.count_documents(&json!({ "role": "admin" }))?))
            })
            .index(IndexSpec::new(["role"]))
    }

    fn setup_model() -> (TempDir, Store, Model) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let model = Model::new(&store, "users", user_schema()).unwrap();
        (tmp, store, model)
    }

    #[test]
    fn test_model_creates_declared_indexes() {
        let (_tmp, store, _model) = setup_model();
        let fields: Vec<String> = store.list_indexes("users").into_iter().map(|i| i.field).collect();
        assert_eq!(fields, vec!["_id", "email", "role"]);
    }

    #[test]
    fn test_create_applies_defaults_and_transforms() {
        let (_tmp, _store, model) = setup_model();
        let user = model
            .create(json!({ "name": "  Alice ", "email": "ALICE@X.IO" }))
            .unwrap();
        assert_eq!(user.get("name"), Some(json!("Alice")));
        assert_eq!(user.get("email"), Some(json!("alice@x.io")));
        assert_eq!(user.get("role"), Some(json!("member")));
        assert!(crate::document::is_object_id(user.id()));
        assert!(model.find_by_id(user.id()).unwrap().is_some());
    }

    #[test]
    fn test_create_reports_all_violations() {
        let (_tmp, _store, model) = setup_model();
        let err = model.create(json!({ "role": "owner", "age": -3 })).unwrap_err();
        let NestDbError::Validation(errors) = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(errors.fields(), vec!["name", "email", "role", "age"]);
        assert_eq!(model.count_documents(&Value::Null).unwrap(), 0);
    }

    #[test]
    fn test_unique_field_enforced() {
        let (_tmp, _store, model) = setup_model();
        model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();
        let err = model.create(json!({ "name": "B", "email": "A@X.IO" })).unwrap_err();
        assert!(matches!(err, NestDbError::DuplicateKey { .. }));
    }

    #[test]
    fn test_hooks_order_and_abort() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (pre, post) = (Arc::clone(&calls), Arc::clone(&calls));
        let schema = user_schema()
            .pre(HookAction::Save, "stamp", move |doc| {
                pre.lock().unwrap().push("pre");
                doc.insert("stamped".into(), json!(true));
                Ok(())
            })
            .pre(HookAction::Save, "no-bots", |doc| {
                if doc.get("name") == Some(&json!("bot")) {
                    return Err(NestDbError::Other("bots are not welcome".into()));
                }
                Ok(())
            })
            .post(HookAction::Save, "audit", move |_| {
                post.lock().unwrap().push("post");
                Ok(())
            });
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let model = Model::new(&store, "users", schema).unwrap();

        let user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();
        assert_eq!(user.get("stamped"), Some(json!(true)));
        assert_eq!(*calls.lock().unwrap(), vec!["pre", "post"]);

        let err = model.create(json!({ "name": "bot", "email": "b@x.io" })).unwrap_err();
        assert!(matches!(err, NestDbError::Hook { ref hook, .. } if hook == "no-bots"));
        assert_eq!(model.count_documents(&Value::Null).unwrap(), 1);
    }

    #[test]
    fn test_model_updates_are_validated() {
        let (_tmp, _store, model) = setup_model();
        let user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();

        let err = model
            .update_one(&json!({ "name": "A" }), &json!({ "$set": { "role": "owner" } }))
            .unwrap_err();
        assert!(matches!(err, NestDbError::Validation(_)));
        assert!(model
            .find_by_id_and_update(user.id(), &json!({ "$unset": { "email": "" } }))
            .is_err());

        let updated = model
            .find_by_id_and_update(user.id(), &json!({ "$set": { "role": "admin" } }))
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("role"), Some(json!("admin")));
        assert_eq!(model.call_static("admins", &[]).unwrap(), json!(1));
    }

    #[test]
    fn test_document_save_and_refresh() {
        let (_tmp, _store, model) = setup_model();
        let mut user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();
        let created = user.get("updatedAt");

        std::thread::sleep(std::time::Duration::from_millis(5));
        user.set("name", "  Renamed  ").unwrap();
        user.set("profile.city", "Oslo").unwrap();
        user.save().unwrap();
        assert_eq!(user.get("name"), Some(json!("Renamed")));
        assert_ne!(user.get("updatedAt"), created);

        let stored = model.find_by_id(user.id()).unwrap().unwrap();
        assert_eq!(stored.get("profile.city"), Some(json!("Oslo")));

        user.set("age", -1).unwrap();
        assert!(matches!(user.save(), Err(NestDbError::Validation(_))));
        assert!(user.set("_id", "other").is_err());
    }

    #[test]
    fn test_save_after_removal_is_not_found() {
        let (_tmp, _store, model) = setup_model();
        let mut user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();
        assert!(user.remove().unwrap());
        assert!(!user.remove().unwrap());
        assert!(matches!(user.save(), Err(NestDbError::NotFound { .. })));
    }

    #[test]
    fn test_methods_virtuals_and_serialization() {
        let (_tmp, _store, model) = setup_model();
        let mut user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();

        assert_eq!(user.call("login", &[]).unwrap(), json!(1));
        assert_eq!(user.call("login", &[]).unwrap(), json!(2));
        assert_eq!(model.find_by_id(user.id()).unwrap().unwrap().get("logins"), Some(json!(2)));
        assert!(user.call("missing", &[]).is_err());
        assert!(model.call_static("missing", &[]).is_err());

        assert_eq!(user.get("label"), Some(json!("A <a@x.io>")));
        assert!(!user.to_object().contains_key("label"));
        assert_eq!(user.to_object_with_virtuals()["label"], json!("A <a@x.io>"));

        let serialized = serde_json::to_value(&user).unwrap();
        assert_eq!(serialized, Value::Object(user.to_object()));
    }

    #[test]
    fn test_find_by_id_and_delete_runs_hooks() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        let schema = user_schema().post(HookAction::Delete, "log", move |doc| {
            sink.lock().unwrap().push(doc["name"].clone());
            Ok(())
        });
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let model = Model::new(&store, "users", schema).unwrap();

        let user = model.create(json!({ "name": "A", "email": "a@x.io" })).unwrap();
        let removed = model.find_by_id_and_delete(user.id()).unwrap().unwrap();
        assert_eq!(removed.id(), user.id());
        assert!(model.find_by_id_and_delete(user.id()).unwrap().is_none());
        assert_eq!(*deleted.lock().unwrap(), vec![json!("A")]);
    }

    #[test]
    fn test_create_many_stops_at_first_failure() {
        let (_tmp, _store, model) = setup_model();
        let err = model
            .create_many(vec![
                json!({ "name": "A", "email": "a@x.io" }),
                json!({ "name": "B" }),
                json!({ "name": "C", "email": "c@x.io" }),
            ])
            .unwrap_err();
        assert!(matches!(err, NestDbError::Validation(_)));
        assert_eq!(model.distinct("name", &Value::Null).unwrap(), vec![json!("A")]);
    }
}
