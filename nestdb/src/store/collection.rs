use super::{CollectionData, Store};
use crate::aggregate::Pipeline;
use crate::document::{
    generate_id, get_field, into_document, now_timestamp, values_equal, Document, CREATED_AT,
    ID_FIELD, UPDATED_AT,
};
use crate::error::{NestDbError, Result};
use crate::query::{Filter, FindOptions};
use crate::update::Update;
use serde::Serialize;
use serde_json::Value;

/// Outcome of an update call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub matched: usize,
    pub modified: usize,
}

/// A handle to one named collection of a [`Store`].
#[derive(Clone, Debug)]
pub struct Collection {
    store: Store,
    name: String,
}

impl Collection {
    pub(crate) fn new(store: Store, name: String) -> Self {
        Collection { store, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Insert one document and return it as stored.
    pub fn insert_one(&self, doc: Value) -> Result<Document> {
        let mut inserted = self.insert_many(vec![doc])?;
        inserted
            .pop()
            .ok_or_else(|| NestDbError::Other("insert produced no document".to_string()))
    }

    /// Insert a batch. Either every document is inserted or none is.
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Document>> {
        let now = now_timestamp();
        let prepared = docs
            .into_iter()
            .map(|doc| prepare_insert(doc, &now))
            .collect::<Result<Vec<_>>>()?;
        if prepared.is_empty() {
            return Ok(prepared);
        }

        {
            let mut state = self.store.write_state();
            self.store.ensure_open(&self.name)?;
            let data = self.data_mut(&mut state);
            for index in data.unique_indexes() {
                if let Some(value) = index.first_duplicate(&prepared) {
                    return Err(self.duplicate(index.field(), value));
                }
                for doc in &prepared {
                    if let Some(value) = index.conflicts(doc) {
                        return Err(self.duplicate(index.field(), value));
                    }
                }
            }
            data.docs.extend(prepared.iter().cloned());
            data.rebuild_indexes();
            self.store.schedule_write(&self.name);
        }

        log::debug!("Inserted {} documents into {}", prepared.len(), self.name);
        Ok(prepared)
    }

    pub fn find(&self, filter: &Value, options: &FindOptions) -> Result<Vec<Document>> {
        Ok(self.find_matching(&Filter::parse(filter)?, options))
    }

    pub fn find_one(&self, filter: &Value) -> Result<Option<Document>> {
        let filter = Filter::parse(filter)?;
        Ok(self.find_matching(&filter, &FindOptions::new().limit(1)).pop())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        let state = self.store.read_state();
        Ok(state
            .get(&self.name)
            .and_then(|data| data.position_of(id).map(|pos| data.docs[pos].clone())))
    }

    /// Run an already-parsed filter, then shape the results.
    pub fn find_matching(&self, filter: &Filter, options: &FindOptions) -> Vec<Document> {
        let state = self.store.read_state();
        let Some(data) = state.get(&self.name) else {
            return Vec::new();
        };
        // Without sorting or skipping, a limit can stop the scan early.
        let scan_limit = match (&options.sort, options.skip) {
            (None, None) => options.limit,
            _ => None,
        };
        let matched = matching_positions(data, filter, scan_limit)
            .into_iter()
            .map(|pos| data.docs[pos].clone())
            .collect();
        options.apply(matched)
    }

    pub fn count_documents(&self, filter: &Value) -> Result<usize> {
        let filter = Filter::parse(filter)?;
        let state = self.store.read_state();
        Ok(state
            .get(&self.name)
            .map(|data| matching_positions(data, &filter, None).len())
            .unwrap_or(0))
    }

    pub fn exists(&self, filter: &Value) -> Result<bool> {
        Ok(self.find_one(filter)?.is_some())
    }

    /// Distinct values of `field` over matching documents, in first-seen
    /// order. Array values contribute their elements.
    pub fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        let docs = self.find(filter, &FindOptions::new())?;
        let mut values: Vec<Value> = Vec::new();
        let mut push = |value: &Value| {
            if !values.iter().any(|v| values_equal(v, value)) {
                values.push(value.clone());
            }
        };
        for doc in &docs {
            match get_field(doc, field) {
                Some(Value::Array(items)) => items.iter().for_each(&mut push),
                Some(value) => push(value),
                None => {}
            }
        }
        Ok(values)
    }

    /// Run an aggregation pipeline over the collection.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Document>> {
        let pipeline = Pipeline::parse(pipeline)?;
        let input = match pipeline.leading_match() {
            Some(filter) => self.find_matching(filter, &FindOptions::new()),
            None => self.find_matching(&Filter::All, &FindOptions::new()),
        };
        Ok(pipeline.run(input))
    }

    pub fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let (result, _) =
            self.update_matching(&Filter::parse(filter)?, &Update::parse(update)?, false, &|_| Ok(()))?;
        Ok(result)
    }

    pub fn update_many(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let (result, _) =
            self.update_matching(&Filter::parse(filter)?, &Update::parse(update)?, true, &|_| Ok(()))?;
        Ok(result)
    }

    /// Update one document by id and return its new version.
    pub fn find_by_id_and_update(&self, id: &str, update: &Value) -> Result<Option<Document>> {
        let (_, mut docs) =
            self.update_matching(&Filter::by_id(id), &Update::parse(update)?, false, &|_| Ok(()))?;
        Ok(docs.pop())
    }

    /// Apply `update` to the first (or every) matching document.
    ///
    /// Each updated version is built on a copy, stamped with a fresh
    /// `updatedAt`, passed to `check`, and tested against every unique index.
    /// Only when all of that succeeds for every matched document are the
    /// originals replaced; otherwise nothing changes. Returns the counts and
    /// the post-update versions of all matched documents.
    pub fn update_matching(
        &self,
        filter: &Filter,
        update: &Update,
        many: bool,
        check: &dyn Fn(&Document) -> Result<()>,
    ) -> Result<(UpdateResult, Vec<Document>)> {
        let (result, after) = {
            let mut state = self.store.write_state();
            self.store.ensure_open(&self.name)?;
            let data = self.data_mut(&mut state);
            let positions = matching_positions(data, filter, (!many).then_some(1));

            let now = now_timestamp();
            let mut replacements = Vec::new();
            let mut after = Vec::with_capacity(positions.len());
            for &pos in &positions {
                let original = &data.docs[pos];
                let mut updated = update.apply(original)?;
                if updated == *original {
                    after.push(updated);
                    continue;
                }
                updated.insert(UPDATED_AT.to_string(), Value::String(now.clone()));
                check(&updated)?;
                after.push(updated.clone());
                replacements.push((pos, updated));
            }

            if !replacements.is_empty() {
                let mut candidate = data.docs.clone();
                for (pos, updated) in &replacements {
                    candidate[*pos] = updated.clone();
                }
                for index in data.unique_indexes() {
                    if let Some(value) = index.first_duplicate(&candidate) {
                        return Err(self.duplicate(index.field(), value));
                    }
                }
                data.docs = candidate;
                data.rebuild_indexes();
                self.store.schedule_write(&self.name);
            }

            let result = UpdateResult {
                matched: positions.len(),
                modified: replacements.len(),
            };
            (result, after)
        };

        if result.modified > 0 {
            log::debug!("Updated {} documents in {}", result.modified, self.name);
        }
        Ok((result, after))
    }

    pub fn delete_one(&self, filter: &Value) -> Result<usize> {
        Ok(self.delete_matching(&Filter::parse(filter)?, false)?.len())
    }

    pub fn delete_many(&self, filter: &Value) -> Result<usize> {
        Ok(self.delete_matching(&Filter::parse(filter)?, true)?.len())
    }

    /// Delete one document by id and return it.
    pub fn find_by_id_and_delete(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.delete_matching(&Filter::by_id(id), false)?.pop())
    }

    /// Remove the first (or every) matching document; returns the removed
    /// documents. Deleting nothing schedules no write.
    pub fn delete_matching(&self, filter: &Filter, many: bool) -> Result<Vec<Document>> {
        let removed = {
            let mut state = self.store.write_state();
            self.store.ensure_open(&self.name)?;
            let Some(data) = state.get_mut(&self.name) else {
                return Ok(Vec::new());
            };
            let positions = matching_positions(data, filter, (!many).then_some(1));
            if positions.is_empty() {
                return Ok(Vec::new());
            }
            let mut removed: Vec<Document> = positions
                .iter()
                .rev()
                .map(|&pos| data.docs.remove(pos))
                .collect();
            removed.reverse();
            data.rebuild_indexes();
            self.store.schedule_write(&self.name);
            removed
        };

        log::debug!("Deleted {} documents from {}", removed.len(), self.name);
        Ok(removed)
    }

    fn data_mut<'a>(
        &self,
        state: &'a mut std::collections::HashMap<String, CollectionData>,
    ) -> &'a mut CollectionData {
        state
            .entry(self.name.clone())
            .or_insert_with(|| CollectionData::new(Vec::new()))
    }

    fn duplicate(&self, field: &str, value: &Value) -> NestDbError {
        NestDbError::DuplicateKey {
            collection: self.name.clone(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

/// Give a new document its id and timestamps. A caller-supplied string
/// `_id` is kept.
fn prepare_insert(value: Value, now: &str) -> Result<Document> {
    let mut fields = into_document(value)?;
    let id = match fields.shift_remove(ID_FIELD) {
        None | Some(Value::Null) => generate_id(),
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(other) => {
            return Err(NestDbError::InvalidDocument(format!(
                "{ID_FIELD} must be a non-empty string, got {other}"
            )))
        }
    };
    fields.shift_remove(CREATED_AT);
    fields.shift_remove(UPDATED_AT);

    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), Value::String(id));
    doc.extend(fields);
    doc.insert(CREATED_AT.to_string(), Value::String(now.to_string()));
    doc.insert(UPDATED_AT.to_string(), Value::String(now.to_string()));
    Ok(doc)
}

/// Positions of matching documents in insertion order. When the filter pins
/// an indexed field to a scalar, only that index's bucket is examined.
fn matching_positions(data: &CollectionData, filter: &Filter, limit: Option<usize>) -> Vec<usize> {
    let limit = limit.unwrap_or(usize::MAX);
    let candidates: Box<dyn Iterator<Item = usize>> = match candidate_positions(data, filter) {
        Some(positions) => Box::new(positions.into_iter()),
        None => Box::new(0..data.docs.len()),
    };
    candidates
        .filter(|&pos| filter.matches(&data.docs[pos]))
        .take(limit)
        .collect()
}

fn candidate_positions(data: &CollectionData, filter: &Filter) -> Option<Vec<usize>> {
    filter
        .equality_conditions()
        .into_iter()
        .find_map(|(path, value)| data.index(path).map(|index| (index, value)))
        .map(|(index, value)| {
            let mut positions: Vec<usize> = index
                .lookup(value)
                .iter()
                .filter_map(|id| data.position_of(id))
                .collect();
            positions.sort_unstable();
            positions
        })
}
