// SPDX-License-Identifier: Apache-2.0

//! The datamodel consolidator.
//!
//! Builds the effective schema from the configuration, fetches every
//! fragment, enforces merge constraints to a fixpoint, merges fragments
//! under their pkey merge constraints, restores merge inconsistencies from
//! the cache, then enforces cross-type integrity constraints to a fixpoint.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use syncflow_config::{OnMergeConflict, ServerConfig, SourceName, TypeName};
use syncflow_expr::{CompileOpts, Engine, EvalContext, Expression};
use syncflow_model::{
    DataObject, DataObjectList, Dataschema, Error as ModelError, Pkey, TypeSchema,
    reserved_context_vars,
};
use tracing::debug;

use crate::adapter::SourceAdapter;
use crate::error::Error;
use crate::fragment::Fragment;

#[derive(Debug)]
struct IntegrityRules {
    constraints: Vec<Expression>,
    /// Context names the constraints need; only these are populated.
    vars: BTreeSet<String>,
}

/// The consolidated datamodel: schema, fragments, merged view and cache.
#[derive(Debug)]
pub struct Datamodel {
    engine: Engine,
    schema: Dataschema,
    fragments: IndexMap<TypeName, Vec<Fragment>>,
    integrity: IndexMap<TypeName, IntegrityRules>,
    /// Union of the merge-constraint context names per type.
    merge_vars: IndexMap<TypeName, BTreeSet<String>>,
    on_merge_conflict: IndexMap<TypeName, OnMergeConflict>,

    /// The merged view of the last pass, per type.
    pub data: IndexMap<TypeName, DataObjectList>,
    /// The last successfully emitted view, per type.
    pub cache: IndexMap<TypeName, DataObjectList>,
}

impl Datamodel {
    /// Builds the datamodel from configuration and a set of source
    /// adapters.
    ///
    /// Every compile-time problem (bad mapping, statement in a template,
    /// missing primary key, unknown display variables, missing adapter) is
    /// fatal here, before anything is fetched.
    pub fn new(
        config: &ServerConfig,
        adapters: &HashMap<SourceName, Arc<dyn SourceAdapter>>,
        engine: Engine,
    ) -> Result<Self, Error> {
        let mut fragments: IndexMap<TypeName, Vec<Fragment>> = IndexMap::new();
        let mut merge_vars: IndexMap<TypeName, BTreeSet<String>> = IndexMap::new();
        let mut on_merge_conflict = IndexMap::new();
        let mut integrity = IndexMap::new();
        let mut schema_types = IndexMap::new();

        for (objtype, typecfg) in &config.datamodel {
            let pkey_spec = typecfg.primarykeyattr.clone();
            let mut frags = Vec::with_capacity(typecfg.sources.len());
            for (srcname, srccfg) in &typecfg.sources {
                let adapter = adapters
                    .get(srcname)
                    .cloned()
                    .ok_or_else(|| Error::UnknownSource {
                        source_name: srcname.clone(),
                    })?;
                frags.push(Fragment::new(
                    objtype,
                    srcname,
                    srccfg,
                    pkey_spec.clone(),
                    adapter,
                    &engine,
                )?);
            }

            let type_schema = build_type_schema(objtype, typecfg, &frags, &engine)?;
            let _ = schema_types.insert(objtype.clone(), type_schema);

            let vars = frags
                .iter()
                .flat_map(|f| f.merge_constraint_vars.iter().cloned())
                .collect();
            let _ = merge_vars.insert(objtype.clone(), vars);
            let _ = on_merge_conflict.insert(objtype.clone(), typecfg.on_merge_conflict);

            let constraint_ctx = format!("datamodel.{objtype}.integrity_constraints");
            let mut int_vars = BTreeSet::new();
            let mut constraints = Vec::with_capacity(typecfg.integrity_constraints.len());
            for constraint in &typecfg.integrity_constraints {
                let expr = engine.compile(constraint, &constraint_ctx, CompileOpts::default())?;
                int_vars.extend(expr.variables().iter().cloned());
                constraints.push(expr);
            }
            let _ = integrity.insert(
                objtype.clone(),
                IntegrityRules {
                    constraints,
                    vars: int_vars,
                },
            );

            let _ = fragments.insert(objtype.clone(), frags);
        }

        let data = config
            .datamodel
            .keys()
            .map(|t| (t.clone(), DataObjectList::new()))
            .collect();
        let cache = config
            .datamodel
            .keys()
            .map(|t| (t.clone(), DataObjectList::new()))
            .collect();

        Ok(Self {
            engine,
            schema: Dataschema {
                types: schema_types,
            },
            fragments,
            integrity,
            merge_vars,
            on_merge_conflict,
            data,
            cache,
        })
    }

    /// The effective schema.
    #[must_use]
    pub const fn schema(&self) -> &Dataschema {
        &self.schema
    }

    /// The expression engine the datamodel was built with.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Fetches every fragment, enforces constraints and stores the merged
    /// view into [`Datamodel::data`].
    ///
    /// Types are processed in schema order (leaves first) to minimize
    /// transient inconsistencies when sources are updated concurrently.
    pub async fn fetch(&mut self) -> Result<(), Error> {
        let engine = &self.engine;
        let types: Vec<TypeName> = self.fragments.keys().cloned().collect();

        for objtype in &types {
            let cache = self.cache.get(objtype).cloned().unwrap_or_default();
            let frags = self
                .fragments
                .get_mut(objtype)
                .expect("fragments exist for every type");

            let start = Instant::now();
            for fragment in frags.iter_mut() {
                fragment.fetch(&cache, engine).await?;
            }
            debug!(
                objtype = %objtype,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "fetched and converted all fragments"
            );

            // Merge-constraint fixpoint: dropping an object can invalidate
            // another fragment's constraint, so loop until a full pass drops
            // nothing.
            let mut constraint_filtered = BTreeSet::new();
            let needed = self.merge_vars.get(objtype).cloned().unwrap_or_default();
            if frags.iter().any(|f| !f.merge_constraints.is_empty()) {
                let start = Instant::now();
                loop {
                    let mut context = EvalContext::new();
                    for fragment in frags.iter() {
                        let pkeys_var = format!("{}_pkeys", fragment.source);
                        if needed.contains(&pkeys_var) {
                            let _ = context.insert(
                                pkeys_var,
                                Value::Array(
                                    fragment.objects.pkeys().iter().map(Pkey::to_value).collect(),
                                ),
                            );
                        }
                        if needed.contains(&fragment.source) {
                            let _ = context.insert(
                                fragment.source.clone(),
                                Value::Array(fragment.objects.to_native()),
                            );
                        }
                    }

                    let mut changed = false;
                    for fragment in frags.iter_mut() {
                        if fragment.merge_constraints.is_empty() {
                            continue;
                        }
                        let mut to_remove = Vec::new();
                        for obj in fragment.objects.iter() {
                            let mut obj_context = context.clone();
                            if needed.contains("_SELF") {
                                let _ = obj_context
                                    .insert("_SELF".to_string(), Value::Object(obj.to_native()));
                            }
                            for constraint in &fragment.merge_constraints {
                                if !engine.eval_bool(constraint, &obj_context)? {
                                    to_remove.push(obj.pkey.clone());
                                    break;
                                }
                            }
                        }
                        if !to_remove.is_empty() {
                            changed = true;
                            for pkey in to_remove {
                                let _ = fragment.objects.remove(&pkey);
                                let _ = constraint_filtered.insert(pkey);
                            }
                        }
                    }
                    if !changed {
                        break;
                    }
                }
                debug!(
                    objtype = %objtype,
                    filtered = constraint_filtered.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "merge constraints enforced"
                );
            }

            // Merge fragments into the consolidated list, first fragment as
            // the base.
            let dont_merge = self.on_merge_conflict.get(objtype)
                == Some(&OnMergeConflict::UseCachedEntry);
            let mut iter = frags.iter();
            let mut objlist = iter
                .next()
                .map(|f| f.objects.clone())
                .unwrap_or_default();
            for fragment in iter {
                let _ = objlist.merge_with(
                    fragment.objects.clone(),
                    fragment.pkey_merge_constraint,
                    dont_merge,
                );
            }
            objlist.merge_filtered.extend(constraint_filtered);

            // Keys filtered during merge keep their cached value while the
            // sources are inconsistent.
            objlist.replace_inconsistencies_by_cached_values(&cache);
            let _ = self.data.insert(objtype.clone(), objlist);
        }

        self.enforce_integrity_constraints()?;
        Ok(())
    }

    /// Cross-type integrity fixpoint: removing an object from one type can
    /// invalidate constraints on another type referencing it, so loop over
    /// all types until stable.
    fn enforce_integrity_constraints(&mut self) -> Result<(), Error> {
        if self.integrity.values().all(|r| r.constraints.is_empty()) {
            return Ok(());
        }
        let start = Instant::now();
        let types: Vec<TypeName> = self.data.keys().cloned().collect();

        loop {
            let mut changed = false;
            for objtype in &types {
                let rules = match self.integrity.get(objtype) {
                    Some(rules) if !rules.constraints.is_empty() => rules,
                    _ => continue,
                };

                let mut context = EvalContext::new();
                for other in &types {
                    let pkeys_var = format!("{other}_pkeys");
                    if rules.vars.contains(&pkeys_var) {
                        if let Some(list) = self.data.get(other) {
                            let _ = context.insert(
                                pkeys_var,
                                Value::Array(list.pkeys().iter().map(Pkey::to_value).collect()),
                            );
                        }
                    }
                    if rules.vars.contains(other) {
                        if let Some(list) = self.data.get(other) {
                            let _ =
                                context.insert(other.clone(), Value::Array(list.to_native()));
                        }
                    }
                }

                let list = self.data.get(objtype).expect("data exists for every type");
                let mut filtered = BTreeSet::new();
                for obj in list.iter() {
                    let mut obj_context = context.clone();
                    if rules.vars.contains("_SELF") {
                        let _ = obj_context
                            .insert("_SELF".to_string(), Value::Object(obj.to_native()));
                    }
                    for constraint in &rules.constraints {
                        if !self.engine.eval_bool(constraint, &obj_context)? {
                            let _ = filtered.insert(obj.pkey.clone());
                            break;
                        }
                    }
                }

                if !filtered.is_empty() {
                    changed = true;
                    let list = self
                        .data
                        .get_mut(objtype)
                        .expect("data exists for every type");
                    for pkey in &filtered {
                        let _ = list.remove(pkey);
                    }
                    debug!(
                        objtype = %objtype,
                        filtered = filtered.len(),
                        "integrity constraints filtered objects"
                    );
                    list.integrity_filtered.extend(filtered);
                }
            }
            if !changed {
                break;
            }
        }
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "integrity constraints enforced"
        );
        Ok(())
    }

    /// Runs `commit_one` on every fragment of the object's type after its
    /// changes were acknowledged by the bus.
    pub async fn commit_one(&self, objtype: &str, obj: &DataObject) -> Result<(), Error> {
        let cached = self
            .cache
            .get(objtype)
            .and_then(|c| c.get(&obj.pkey))
            .map(DataObject::to_native)
            .unwrap_or_default();
        let fetched = obj.to_native();
        if let Some(frags) = self.fragments.get(objtype) {
            for fragment in frags {
                fragment.commit_one(&cached, &fetched, &self.engine).await?;
            }
        }
        Ok(())
    }

    /// Runs `commit_all` on every fragment of a type after a whole pass was
    /// acknowledged.
    pub async fn commit_all(&self, objtype: &str) -> Result<(), Error> {
        let cached = self
            .cache
            .get(objtype)
            .map(DataObjectList::to_native)
            .unwrap_or_default();
        let fetched = self
            .data
            .get(objtype)
            .map(DataObjectList::to_native)
            .unwrap_or_default();
        if let Some(frags) = self.fragments.get(objtype) {
            for fragment in frags {
                fragment
                    .commit_all(cached.clone(), fetched.clone(), &self.engine)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Consolidates the per-fragment attribute sets of one type and checks the
/// primary key is mapped everywhere.
fn build_type_schema(
    objtype: &str,
    typecfg: &syncflow_config::TypeConfig,
    frags: &[Fragment],
    engine: &Engine,
) -> Result<TypeSchema, Error> {
    let mut count: HashMap<&str, usize> = HashMap::new();
    let mut hermes_attributes = BTreeSet::new();
    let mut remote_attributes = BTreeSet::new();
    let mut secrets = BTreeSet::new();
    let mut cacheonly = BTreeSet::new();
    let mut local = BTreeSet::new();

    for fragment in frags {
        for attr in fragment.mapping.keys() {
            *count.entry(attr.as_str()).or_insert(0) += 1;
            let _ = hermes_attributes.insert(attr.clone());
        }
        remote_attributes.extend(fragment.remote_attributes.iter().cloned());
        secrets.extend(fragment.secrets_attrs.iter().cloned());
        cacheonly.extend(fragment.cacheonly_attrs.iter().cloned());
        local.extend(fragment.local_attrs.iter().cloned());
    }

    // The primary key must be fetched from every source, otherwise
    // fragments cannot be matched up.
    for key_attr in typecfg.primarykeyattr.attrs() {
        if count.get(key_attr).copied().unwrap_or(0) != frags.len() {
            return Err(Error::Model(ModelError::MissingPrimaryKey {
                objtype: objtype.to_string(),
                pkey: typecfg.primarykeyattr.to_string(),
            }));
        }
    }

    let to_string = typecfg
        .to_string
        .as_ref()
        .map(|tpl| {
            let context = format!("datamodel.{objtype}.toString");
            let expr = engine.compile(tpl, &context, CompileOpts::default())?;
            // The display template may only use the type's own attributes.
            let reserved = reserved_context_vars();
            let unknown: Vec<String> = expr
                .variables()
                .iter()
                .filter(|v| !hermes_attributes.contains(*v) && !reserved.contains(*v))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(Error::Model(ModelError::UnknownVars {
                    context,
                    vars: unknown,
                }));
            }
            Ok(expr)
        })
        .transpose()?;

    Ok(TypeSchema {
        hermes_attributes,
        remote_attributes,
        secrets_attributes: secrets,
        cacheonly_attributes: cacheonly,
        local_attributes: local,
        primary_key: typecfg.primarykeyattr.clone(),
        to_string,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemorySource;
    use serde_json::json;

    fn adapters(src: Arc<InMemorySource>) -> HashMap<SourceName, Arc<dyn SourceAdapter>> {
        let mut map: HashMap<SourceName, Arc<dyn SourceAdapter>> = HashMap::new();
        let _ = map.insert("main".to_string(), src);
        map
    }

    #[test]
    fn missing_primary_key_is_fatal() {
        let config = ServerConfig::from_yaml(
            r"
datamodel:
  Users:
    primarykeyattr: user_id
    sources:
      main:
        attrsmapping:
          login: LOGIN
        fetch:
          type: fetch
          query: users
",
        )
        .unwrap();
        let src = Arc::new(InMemorySource::new());
        let err = Datamodel::new(&config, &adapters(src), Engine::new()).unwrap_err();
        assert!(
            matches!(err, Error::Model(ModelError::MissingPrimaryKey { .. })),
            "{err:?}"
        );
    }

    #[test]
    fn tostring_with_unknown_attrs_is_fatal() {
        let config = ServerConfig::from_yaml(
            r#"
datamodel:
  Users:
    primarykeyattr: user_id
    toString: "{{ unknown_attr }}"
    sources:
      main:
        attrsmapping:
          user_id: ID
        fetch:
          type: fetch
          query: users
"#,
        )
        .unwrap();
        let src = Arc::new(InMemorySource::new());
        let err = Datamodel::new(&config, &adapters(src), Engine::new()).unwrap_err();
        assert!(
            matches!(err, Error::Model(ModelError::UnknownVars { .. })),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn integrity_constraints_reach_a_fixpoint() {
        // Members reference users; a second-order constraint on Rights
        // references members, so removing a user must cascade.
        let config = ServerConfig::from_yaml(
            r#"
datamodel:
  Users:
    primarykeyattr: id
    sources:
      main:
        attrsmapping:
          id: ID
        merge_constraints:
          - "{{ _SELF.id != 99 }}"
        fetch:
          type: fetch
          query: users
  Members:
    primarykeyattr: id
    integrity_constraints:
      - "{{ _SELF.user_id in Users_pkeys }}"
    sources:
      main:
        attrsmapping:
          id: ID
          user_id: USER
        fetch:
          type: fetch
          query: members
  Rights:
    primarykeyattr: id
    integrity_constraints:
      - "{{ _SELF.member_id in Members_pkeys }}"
    sources:
      main:
        attrsmapping:
          id: ID
          member_id: MEMBER
        fetch:
          type: fetch
          query: rights
"#,
        )
        .unwrap();

        let src = Arc::new(InMemorySource::new());
        src.set_rows("users", vec![json!({"ID": 1}), json!({"ID": 99})]);
        src.set_rows(
            "members",
            vec![
                json!({"ID": 10, "USER": 1}),
                json!({"ID": 11, "USER": 99}),
            ],
        );
        src.set_rows(
            "rights",
            vec![
                json!({"ID": 100, "MEMBER": 10}),
                json!({"ID": 101, "MEMBER": 11}),
            ],
        );

        let mut dm = Datamodel::new(&config, &adapters(src), Engine::new()).unwrap();
        dm.fetch().await.unwrap();

        // User 99 is dropped by the merge constraint, member 11 by the first
        // integrity pass, right 101 by the second.
        assert_eq!(dm.data["Users"].len(), 1);
        assert_eq!(dm.data["Members"].len(), 1);
        assert_eq!(dm.data["Rights"].len(), 1);
        assert_eq!(dm.data["Members"].integrity_filtered.len(), 1);
        assert_eq!(dm.data["Rights"].integrity_filtered.len(), 1);
    }
}
