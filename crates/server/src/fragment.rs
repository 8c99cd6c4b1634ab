// SPDX-License-Identifier: Apache-2.0

//! One (object type, source) pair: per-source mapping, queries and fetched
//! objects.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use syncflow_config::{
    AttrName, PkeyMergeConstraint, PkeySpec, QuerySpec, QueryType, SourceConfig, SourceName,
    TypeName, error::error_context,
};
use syncflow_expr::{CompileOpts, Engine, EvalContext, Expression, TplValue};
use syncflow_model::{DataObject, DataObjectList, project_remote_pkey, reserved_context_vars};
use tracing::{debug, warn};

use crate::adapter::{Row, SourceAdapter};
use crate::error::Error;

/// A query compiled against the expression engine.
#[derive(Debug)]
struct CompiledQuery {
    querytype: QueryType,
    /// `None` for vars-only queries (an empty query string is valid for
    /// commits, some adapters only look at the variables).
    query: Option<Expression>,
    vars: TplValue,
}

impl CompiledQuery {
    fn compile(spec: &QuerySpec, context: &str, engine: &Engine) -> Result<Self, Error> {
        let query = if spec.query.is_empty() {
            None
        } else {
            Some(engine.compile(&spec.query, context, CompileOpts::default())?)
        };
        let mut scratch = BTreeSet::new();
        Ok(Self {
            querytype: spec.querytype,
            query,
            vars: engine.compile_value(
                &spec.vars,
                context,
                CompileOpts::default(),
                &mut scratch,
                &BTreeSet::new(),
            )?,
        })
    }

    fn render_query(&self, engine: &Engine, context: &EvalContext) -> Result<String, Error> {
        match &self.query {
            Some(query) => Ok(engine.render_string(query, context)?),
            None => Ok(String::new()),
        }
    }
}

/// Handles settings, data and access to the remote source data of one
/// object type for one source. Fragments of the same type are consolidated
/// and merged by the datamodel.
pub struct Fragment {
    objtype: TypeName,
    pub(crate) source: SourceName,
    adapter: Arc<dyn SourceAdapter>,
    pkey_spec: PkeySpec,

    /// hermes attribute → compiled value spec.
    pub(crate) mapping: IndexMap<AttrName, Expression>,
    /// Remote attribute names this mapping reads from rows.
    pub(crate) remote_attributes: BTreeSet<String>,

    pub(crate) secrets_attrs: BTreeSet<AttrName>,
    pub(crate) cacheonly_attrs: BTreeSet<AttrName>,
    pub(crate) local_attrs: BTreeSet<AttrName>,

    pub(crate) merge_constraints: Vec<Expression>,
    /// Context names the merge constraints need; the consolidator populates
    /// only these.
    pub(crate) merge_constraint_vars: BTreeSet<String>,
    pub(crate) pkey_merge_constraint: PkeyMergeConstraint,

    fetch: CompiledQuery,
    commit_one: Option<CompiledQuery>,
    commit_all: Option<CompiledQuery>,

    /// The objects built from the last fetch, before consolidation.
    pub(crate) objects: DataObjectList,
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("objtype", &self.objtype)
            .field("source", &self.source)
            .field("pkey_spec", &self.pkey_spec)
            .field("mapping", &self.mapping)
            .field("remote_attributes", &self.remote_attributes)
            .field("secrets_attrs", &self.secrets_attrs)
            .field("cacheonly_attrs", &self.cacheonly_attrs)
            .field("local_attrs", &self.local_attrs)
            .field("merge_constraints", &self.merge_constraints)
            .field("merge_constraint_vars", &self.merge_constraint_vars)
            .field("pkey_merge_constraint", &self.pkey_merge_constraint)
            .field("fetch", &self.fetch)
            .field("commit_one", &self.commit_one)
            .field("commit_all", &self.commit_all)
            .field("objects", &self.objects)
            .finish_non_exhaustive()
    }
}

impl Fragment {
    pub(crate) fn new(
        objtype: &str,
        source: &str,
        cfg: &SourceConfig,
        pkey_spec: PkeySpec,
        adapter: Arc<dyn SourceAdapter>,
        engine: &Engine,
    ) -> Result<Self, Error> {
        let reserved = reserved_context_vars();

        let mapping_ctx = error_context(objtype, source, "attrsmapping");
        let mut remote_attributes = BTreeSet::new();
        let mut mapping = IndexMap::with_capacity(cfg.attrsmapping.len());
        for (hermes_attr, value_spec) in &cfg.attrsmapping {
            let expr = engine.compile(
                value_spec,
                &mapping_ctx,
                CompileOpts {
                    one_template: true,
                    one_var: false,
                },
            )?;
            remote_attributes.extend(
                expr.variables()
                    .iter()
                    .filter(|v| !reserved.contains(*v))
                    .cloned(),
            );
            let _ = mapping.insert(hermes_attr.clone(), expr);
        }

        let constraint_ctx = error_context(objtype, source, "merge_constraints");
        let mut merge_constraint_vars = BTreeSet::new();
        let mut merge_constraints = Vec::with_capacity(cfg.merge_constraints.len());
        for constraint in &cfg.merge_constraints {
            let expr = engine.compile(constraint, &constraint_ctx, CompileOpts::default())?;
            merge_constraint_vars.extend(expr.variables().iter().cloned());
            merge_constraints.push(expr);
        }

        let fetch = CompiledQuery::compile(&cfg.fetch, &error_context(objtype, source, "fetch"), engine)?;
        let commit_one = cfg
            .commit_one
            .as_ref()
            .map(|spec| CompiledQuery::compile(spec, &error_context(objtype, source, "commit_one"), engine))
            .transpose()?;
        let commit_all = cfg
            .commit_all
            .as_ref()
            .map(|spec| CompiledQuery::compile(spec, &error_context(objtype, source, "commit_all"), engine))
            .transpose()?;

        Ok(Self {
            objtype: objtype.to_string(),
            source: source.to_string(),
            adapter,
            pkey_spec,
            mapping,
            remote_attributes,
            secrets_attrs: cfg.secrets_attrs.iter().cloned().collect(),
            cacheonly_attrs: cfg.cacheonly_attrs.iter().cloned().collect(),
            local_attrs: cfg.local_attrs.iter().cloned().collect(),
            merge_constraints,
            merge_constraint_vars,
            pkey_merge_constraint: cfg.pkey_merge_constraint,
            fetch,
            commit_one,
            commit_all,
            objects: DataObjectList::new(),
        })
    }

    /// Fetches this fragment's rows and builds its object list.
    ///
    /// The query context exposes `REMOTE_ATTRIBUTES` and `CACHED_VALUES`;
    /// each object is then built with `ITEM_CACHED_VALUES` bound to its
    /// cached counterpart (or an empty map).
    pub(crate) async fn fetch(
        &mut self,
        cache: &DataObjectList,
        engine: &Engine,
    ) -> Result<(), Error> {
        let mut context = EvalContext::new();
        let _ = context.insert(
            "REMOTE_ATTRIBUTES".to_string(),
            Value::Array(
                self.remote_attributes
                    .iter()
                    .map(|a| Value::String(a.clone()))
                    .collect(),
            ),
        );
        let _ = context.insert("CACHED_VALUES".to_string(), Value::Array(cache.to_native()));

        let query = self.fetch.render_query(engine, &context)?;
        let vars = engine.render_value(&self.fetch.vars, &context)?;
        let rows = self
            .run_query(self.fetch.querytype, &query, &vars)
            .await?
            .unwrap_or_default();

        let start = Instant::now();
        self.objects = DataObjectList::new();
        for row in &rows {
            let Some(pkey) = project_remote_pkey(row, &self.mapping, &self.pkey_spec, engine)?
            else {
                warn!(
                    objtype = %self.objtype,
                    source = %self.source,
                    "row skipped: a primary key component is absent or null"
                );
                continue;
            };

            let mut extra = EvalContext::new();
            let item_cache = cache
                .get(&pkey)
                .map(DataObject::to_native)
                .unwrap_or_default();
            let _ = extra.insert("ITEM_CACHED_VALUES".to_string(), Value::Object(item_cache));

            let obj = DataObject::from_remote(pkey, row, &self.mapping, engine, &extra)?;
            self.objects.insert(obj);
        }
        debug!(
            objtype = %self.objtype,
            source = %self.source,
            rows = rows.len(),
            objects = self.objects.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fragment fetch converted"
        );
        Ok(())
    }

    /// Runs the `commit_one` query, if configured, for one acknowledged
    /// object.
    pub(crate) async fn commit_one(
        &self,
        item_cached_values: &serde_json::Map<String, Value>,
        item_fetched_values: &serde_json::Map<String, Value>,
        engine: &Engine,
    ) -> Result<(), Error> {
        let Some(commit) = &self.commit_one else {
            return Ok(());
        };
        let mut context = self.remote_attrs_context();
        let _ = context.insert(
            "ITEM_CACHED_VALUES".to_string(),
            Value::Object(item_cached_values.clone()),
        );
        let _ = context.insert(
            "ITEM_FETCHED_VALUES".to_string(),
            Value::Object(item_fetched_values.clone()),
        );
        let query = commit.render_query(engine, &context)?;
        let vars = engine.render_value(&commit.vars, &context)?;
        let _ = self.run_query(commit.querytype, &query, &vars).await?;
        Ok(())
    }

    /// Runs the `commit_all` query, if configured, after a whole pass was
    /// acknowledged.
    pub(crate) async fn commit_all(
        &self,
        cached_values: Vec<Value>,
        fetched_values: Vec<Value>,
        engine: &Engine,
    ) -> Result<(), Error> {
        let Some(commit) = &self.commit_all else {
            return Ok(());
        };
        let mut context = self.remote_attrs_context();
        let _ = context.insert("CACHED_VALUES".to_string(), Value::Array(cached_values));
        let _ = context.insert("FETCHED_VALUES".to_string(), Value::Array(fetched_values));
        let query = commit.render_query(engine, &context)?;
        let vars = engine.render_value(&commit.vars, &context)?;
        let _ = self.run_query(commit.querytype, &query, &vars).await?;
        Ok(())
    }

    fn remote_attrs_context(&self) -> EvalContext {
        let mut context = EvalContext::new();
        let _ = context.insert(
            "REMOTE_ATTRIBUTES".to_string(),
            Value::Array(
                self.remote_attributes
                    .iter()
                    .map(|a| Value::String(a.clone()))
                    .collect(),
            ),
        );
        context
    }

    /// Runs one query on the adapter, opening it first and closing it on
    /// every exit path. Only `fetch` queries return rows.
    async fn run_query(
        &self,
        querytype: QueryType,
        query: &str,
        vars: &Value,
    ) -> Result<Option<Vec<Row>>, Error> {
        debug!(
            objtype = %self.objtype,
            source = %self.source,
            %querytype,
            "running query"
        );
        let start = Instant::now();

        self.adapter
            .open()
            .await
            .map_err(|e| self.source_failure(querytype, query, &e))?;

        let result = match querytype {
            QueryType::Fetch => self.adapter.fetch(query, vars).await.map(Some),
            QueryType::Add => self.adapter.add(query, vars).await.map(|()| None),
            QueryType::Delete => self.adapter.delete(query, vars).await.map(|()| None),
            QueryType::Modify => self.adapter.modify(query, vars).await.map(|()| None),
        };

        if let Err(e) = self.adapter.close().await {
            warn!(
                objtype = %self.objtype,
                source = %self.source,
                error = %e,
                "adapter close failed"
            );
        }

        let rows = result.map_err(|e| self.source_failure(querytype, query, &e))?;
        debug!(
            objtype = %self.objtype,
            source = %self.source,
            %querytype,
            entries = rows.as_ref().map_or(0, Vec::len),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query returned"
        );
        Ok(rows)
    }

    fn source_failure(
        &self,
        querytype: QueryType,
        query: &str,
        e: &crate::adapter::BoxError,
    ) -> Error {
        Error::SourceFailure {
            source_name: self.source.clone(),
            querytype: querytype.to_string(),
            query: query.to_string(),
            details: e.to_string(),
        }
    }
}
