//! Schema Contract: per-row type contract that propagates through
//! transforms and is validated at pipeline edges.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ElspethError, ErrorKind, ErrorReason};
use crate::value::{RowData, Value, ValueType};

/// How strictly a contract treats fields it doesn't declare.
///
/// Ordered `FIXED < FLEXIBLE < OBSERVED` for merge precedence: the most
/// restrictive mode wins when two contracts are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    Fixed,
    Flexible,
    Observed,
}

/// Where a field's declaration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Declared,
    Inferred,
}

/// One field of a schema contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldContract {
    pub normalized_name: String,
    pub original_name: String,
    pub value_type: ValueType,
    pub required: bool,
    pub source: FieldSource,
}

/// A per-row type contract: ordered field set, inference mode, and lock
/// state. `fields` preserves declaration order (a `Vec`, not a map) so
/// `resolve_headers` can restore the original column ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub mode: ContractMode,
    pub fields: Vec<FieldContract>,
    pub locked: bool,
}

/// A single violation found by `validate_output_against_contract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContractViolation {
    Missing { normalized_name: String },
    TypeMismatch { normalized_name: String, expected: ValueType, found: ValueType },
    UnexpectedInFixed { normalized_name: String },
}

/// Declared schema used to build an output contract at a source or a
/// transform's declared `output_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredSchema {
    pub fields: Vec<DeclaredField>,
    #[serde(default)]
    pub allow_extras: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredField {
    pub normalized_name: String,
    #[serde(default)]
    pub original_name: Option<String>,
    pub value_type: ValueType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Per-node schema behavior flags referenced by graph edge validation and
/// contract propagation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Edge compatibility checks are skipped entirely when either endpoint
    /// is dynamic.
    #[serde(default)]
    pub is_dynamic: bool,
    /// Whether this node's output may introduce fields absent from its
    /// input contract (passed to `propagate_contract`'s `adds_fields`).
    #[serde(default)]
    pub adds_fields: bool,
}

/// Header-resolution mode for sinks restoring column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Normalized,
    Original,
    Custom,
}

impl SchemaContract {
    /// `create_output_contract_from_schema`: build a contract from a
    /// plugin's declared schema. FIXED unless the declaration explicitly
    /// allows extras, in which case FLEXIBLE.
    pub fn create_output_contract_from_schema(declared: &DeclaredSchema) -> Self {
        let fields = declared
            .fields
            .iter()
            .map(|f| FieldContract {
                normalized_name: f.normalized_name.clone(),
                original_name: f.original_name.clone().unwrap_or_else(|| f.normalized_name.clone()),
                value_type: f.value_type,
                required: f.required,
                source: FieldSource::Declared,
            })
            .collect();
        SchemaContract {
            mode: if declared.allow_extras { ContractMode::Flexible } else { ContractMode::Fixed },
            fields,
            locked: false,
        }
    }

    /// An empty, unlocked OBSERVED contract — the starting point for
    /// sources/transforms relying purely on inference.
    pub fn observed() -> Self {
        SchemaContract { mode: ContractMode::Observed, fields: Vec::new(), locked: false }
    }

    fn field(&self, normalized_name: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|f| f.normalized_name == normalized_name)
    }

    /// `propagate_contract`: extend a contract with fields observed in an
    /// output row. If `adds_fields` is false, the contract is unchanged
    /// (a pure pass-through transform declares no new fields). Otherwise,
    /// every row key absent from the contract is added as
    /// `required=false, source=inferred`, inferring its type from the
    /// value (rejecting non-finite floats).
    pub fn propagate_contract(
        input_contract: &SchemaContract,
        output_row: &RowData,
        adds_fields: bool,
    ) -> Result<SchemaContract, ElspethError> {
        if !adds_fields || input_contract.locked {
            return Ok(input_contract.clone());
        }
        let mut contract = input_contract.clone();
        for (name, value) in output_row.iter() {
            if contract.field(name).is_some() {
                continue;
            }
            if value.is_non_finite_float() {
                return Err(ElspethError::Validation(ErrorReason {
                    field: Some(name.clone()),
                    kind: ErrorKind::InvalidValue,
                    message: format!("field '{name}' is a non-finite float (NaN/Infinity)"),
                    retryable: false,
                }));
            }
            tracing::debug!(field = %name, value_type = ?value.type_tag(), "inferring new contract field");
            contract.fields.push(FieldContract {
                normalized_name: name.clone(),
                original_name: name.clone(),
                value_type: value.type_tag(),
                required: false,
                source: FieldSource::Inferred,
            });
        }
        Ok(contract)
    }

    /// `merge_contract_with_output`: the output schema's required set and
    /// types win; `original_name` is preserved from the input contract for
    /// any field that matches by normalized name — the field's original
    /// casing is fixed by whichever edge first declared it.
    pub fn merge_contract_with_output(
        input_contract: &SchemaContract,
        output_schema_contract: &SchemaContract,
    ) -> SchemaContract {
        let mut fields = Vec::with_capacity(output_schema_contract.fields.len());
        for out_field in &output_schema_contract.fields {
            let original_name = input_contract
                .field(&out_field.normalized_name)
                .map(|f| f.original_name.clone())
                .unwrap_or_else(|| out_field.original_name.clone());
            fields.push(FieldContract { original_name, ..out_field.clone() });
        }
        let mode = input_contract.mode.min(output_schema_contract.mode);
        SchemaContract { mode, fields, locked: input_contract.locked || output_schema_contract.locked }
    }

    /// `validate_output_against_contract`: check a row against this
    /// contract, returning every violation found (not just the first).
    pub fn validate_output_against_contract(&self, row: &RowData) -> Vec<ContractViolation> {
        let mut violations = Vec::new();
        let known: std::collections::HashSet<&str> =
            self.fields.iter().map(|f| f.normalized_name.as_str()).collect();

        for field in &self.fields {
            match row.get(&field.normalized_name) {
                None => {
                    if field.required {
                        violations.push(ContractViolation::Missing { normalized_name: field.normalized_name.clone() });
                    }
                }
                Some(value) => {
                    let found = value.type_tag();
                    if !Value::assignable_to(found, field.value_type) {
                        violations.push(ContractViolation::TypeMismatch {
                            normalized_name: field.normalized_name.clone(),
                            expected: field.value_type,
                            found,
                        });
                    }
                }
            }
        }

        if self.mode == ContractMode::Fixed {
            for key in row.keys() {
                if !known.contains(key.as_str()) {
                    violations.push(ContractViolation::UnexpectedInFixed { normalized_name: key.clone() });
                }
            }
        }
        violations
    }

    /// `resolve_headers`: map normalized field name to the header a sink
    /// should write, per the requested mode.
    pub fn resolve_headers(&self, mode: HeaderMode, mapping: Option<&HashMap<String, String>>) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|f| {
                let header = match mode {
                    HeaderMode::Normalized => f.normalized_name.clone(),
                    HeaderMode::Original => f.original_name.clone(),
                    HeaderMode::Custom => mapping
                        .and_then(|m| m.get(&f.normalized_name).cloned())
                        .unwrap_or_else(|| f.normalized_name.clone()),
                };
                (f.normalized_name.clone(), header)
            })
            .collect()
    }

    /// Lock the contract: no further field inference is permitted.
    pub fn lock(&mut self) {
        self.locked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn propagate_contract_is_idempotent() {
        let base = SchemaContract::observed();
        let r = row(&[("id", Value::Int(1)), ("name", Value::String("a".into()))]);
        let once = SchemaContract::propagate_contract(&base, &r, true).unwrap();
        let twice = SchemaContract::propagate_contract(&once, &r, true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn propagate_contract_rejects_non_finite_floats() {
        let base = SchemaContract::observed();
        let r = row(&[("score", Value::Float(f64::NAN))]);
        let err = SchemaContract::propagate_contract(&base, &r, true).unwrap_err();
        assert!(matches!(err, ElspethError::Validation(_)));
    }

    #[test]
    fn propagate_contract_noop_when_adds_fields_false() {
        let base = SchemaContract::observed();
        let r = row(&[("id", Value::Int(1))]);
        let out = SchemaContract::propagate_contract(&base, &r, false).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn fixed_mode_rejects_extras() {
        let declared = DeclaredSchema {
            fields: vec![DeclaredField {
                normalized_name: "id".into(),
                original_name: None,
                value_type: ValueType::Int,
                required: true,
            }],
            allow_extras: false,
        };
        let contract = SchemaContract::create_output_contract_from_schema(&declared);
        let r = row(&[("id", Value::Int(1)), ("extra", Value::String("x".into()))]);
        let violations = contract.validate_output_against_contract(&r);
        assert_eq!(violations, vec![ContractViolation::UnexpectedInFixed { normalized_name: "extra".into() }]);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let declared = DeclaredSchema {
            fields: vec![DeclaredField {
                normalized_name: "id".into(),
                original_name: None,
                value_type: ValueType::Int,
                required: true,
            }],
            allow_extras: true,
        };
        let contract = SchemaContract::create_output_contract_from_schema(&declared);
        let violations = contract.validate_output_against_contract(&RowData::new());
        assert_eq!(violations, vec![ContractViolation::Missing { normalized_name: "id".into() }]);
    }

    #[test]
    fn merge_contract_with_output_preserves_original_name_and_tightens_mode() {
        let mut input = SchemaContract::observed();
        input.fields.push(FieldContract {
            normalized_name: "id".into(),
            original_name: "ID".into(),
            value_type: ValueType::Int,
            required: false,
            source: FieldSource::Inferred,
        });
        let mut output = SchemaContract::observed();
        output.mode = ContractMode::Fixed;
        output.fields.push(FieldContract {
            normalized_name: "id".into(),
            original_name: "id".into(),
            value_type: ValueType::Int,
            required: true,
            source: FieldSource::Declared,
        });
        let merged = SchemaContract::merge_contract_with_output(&input, &output);
        assert_eq!(merged.mode, ContractMode::Fixed);
        assert_eq!(merged.fields[0].original_name, "ID");
        assert!(merged.fields[0].required);
    }

    #[test]
    fn resolve_headers_round_trips_original_names() {
        let declared = DeclaredSchema {
            fields: vec![DeclaredField {
                normalized_name: "user_id".into(),
                original_name: Some("User ID".into()),
                value_type: ValueType::Int,
                required: true,
            }],
            allow_extras: false,
        };
        let contract = SchemaContract::create_output_contract_from_schema(&declared);
        let headers = contract.resolve_headers(HeaderMode::Original, None);
        assert_eq!(headers.get("user_id").unwrap(), "User ID");
    }
}
