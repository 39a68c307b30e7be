// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Kernel trait, builtin kernels, and the kernel registry.
//!
//! Kernels are opaque pure functions of their declared reads. The sandbox is
//! structural: a kernel receives a state view restricted to its read set and
//! a frozen parameter map, and nothing else — no clock, no RNG, no
//! environment, no filesystem, no thread identity. Whatever state-like value
//! a kernel returns, only the op's declared write set is retained.
//!
//! Kernels are allowlisted by the registry. `kernel_hash` is the SHA3-256 of
//! the kernel's canonical body descriptor, and the registry digest (bound
//! into the policy bundle) commits to the full id → hash mapping in sorted
//! order.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Signed;
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::canon;
use crate::ident::{hash_to_wire, sha3_256, FieldId, Hash};
use crate::quantum::{div_half_even, DebtUnit, SCALE};
use crate::state::State;
use crate::value::Value;

/// Frozen kernel parameter map.
pub type Params = BTreeMap<String, Value>;

/// Closed set of kernel failure reasons.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A required parameter was absent or mistyped.
    #[error("bad kernel parameter: {0}")]
    BadParam(&'static str),
    /// The kernel read a field that was not a chain-scale numeric.
    #[error("non-numeric operand field")]
    NonNumericField,
    /// A scaling kernel was given a nonpositive divisor.
    #[error("nonpositive divisor")]
    NonPositiveDivisor,
}

/// An allowlisted pure transition function.
pub trait Kernel: Send + Sync {
    /// Runs the kernel on a read-restricted view, producing a state-like
    /// value. Only the op's declared writes survive projection.
    fn run(&self, view: &State, params: &Params) -> Result<State, KernelError>;

    /// Canonical body descriptor; the registry hashes this.
    fn body_descriptor(&self) -> &'static str;
}

// =============================================================================
// Parameter helpers
// =============================================================================

fn field_param(params: &Params, key: &'static str) -> Result<FieldId, KernelError> {
    match params.get(key) {
        Some(Value::Str(hex)) => {
            FieldId::from_hex(hex).map_err(|_| KernelError::BadParam(key))
        }
        _ => Err(KernelError::BadParam(key)),
    }
}

fn quantum_param(params: &Params, key: &'static str) -> Result<DebtUnit, KernelError> {
    match params.get(key) {
        Some(Value::Quantum(q)) if q.scale() == SCALE => Ok(q.clone()),
        _ => Err(KernelError::BadParam(key)),
    }
}

fn int_param(params: &Params, key: &'static str) -> Result<BigInt, KernelError> {
    match params.get(key) {
        Some(Value::Int(i)) => Ok(i.clone()),
        _ => Err(KernelError::BadParam(key)),
    }
}

fn read_quantum(view: &State, field: &FieldId) -> Result<DebtUnit, KernelError> {
    match view.get(field) {
        None => Ok(DebtUnit::zero()),
        Some(v) => v
            .numeric_raw()
            .map(|raw| DebtUnit::new(raw, SCALE))
            .ok_or(KernelError::NonNumericField),
    }
}

// =============================================================================
// Builtin kernels
// =============================================================================

/// `kern.set_field.v1` — writes `value` to `field`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFieldKernel;

impl Kernel for SetFieldKernel {
    fn run(&self, view: &State, params: &Params) -> Result<State, KernelError> {
        let field = field_param(params, "field")?;
        let value = params
            .get("value")
            .cloned()
            .ok_or(KernelError::BadParam("value"))?;
        let mut writes = BTreeMap::new();
        writes.insert(field, value);
        Ok(view.patched(&writes))
    }

    fn body_descriptor(&self) -> &'static str {
        "kern.set_field.v1{field,value}:write value to field"
    }
}

/// `kern.add_field.v1` — adds `amount` to the numeric value of `field`
/// (missing reads as zero).
#[derive(Debug, Clone, Copy, Default)]
pub struct AddFieldKernel;

impl Kernel for AddFieldKernel {
    fn run(&self, view: &State, params: &Params) -> Result<State, KernelError> {
        let field = field_param(params, "field")?;
        let amount = quantum_param(params, "amount")?;
        let current = read_quantum(view, &field)?;
        let next = current
            .checked_add(&amount)
            .map_err(|_| KernelError::BadParam("amount"))?;
        let mut writes = BTreeMap::new();
        writes.insert(field, Value::Quantum(next));
        Ok(view.patched(&writes))
    }

    fn body_descriptor(&self) -> &'static str {
        "kern.add_field.v1{field,amount}:add amount to field"
    }
}

/// `kern.scale_field.v1` — multiplies the numeric value of `field` by
/// `num/den` with half-even rounding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleFieldKernel;

impl Kernel for ScaleFieldKernel {
    fn run(&self, view: &State, params: &Params) -> Result<State, KernelError> {
        let field = field_param(params, "field")?;
        let num = int_param(params, "num")?;
        let den = int_param(params, "den")?;
        if !den.is_positive() {
            return Err(KernelError::NonPositiveDivisor);
        }
        let current = read_quantum(view, &field)?;
        let scaled = div_half_even(&(current.int_value() * &num), &den);
        let mut writes = BTreeMap::new();
        writes.insert(field, Value::Quantum(DebtUnit::new(scaled, SCALE)));
        Ok(view.patched(&writes))
    }

    fn body_descriptor(&self) -> &'static str {
        "kern.scale_field.v1{field,num,den}:scale field by num/den half-even"
    }
}

/// `kern.clear_field.v1` — resets `field` to the zero quantum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearFieldKernel;

impl Kernel for ClearFieldKernel {
    fn run(&self, view: &State, params: &Params) -> Result<State, KernelError> {
        let field = field_param(params, "field")?;
        let mut writes = BTreeMap::new();
        writes.insert(field, Value::Quantum(DebtUnit::zero()));
        Ok(view.patched(&writes))
    }

    fn body_descriptor(&self) -> &'static str {
        "kern.clear_field.v1{field}:reset field to zero"
    }
}

// =============================================================================
// Registry
// =============================================================================

/// One registered kernel with its content hashes.
#[derive(Clone)]
pub struct RegisteredKernel {
    /// SHA3-256 of the canonical body descriptor.
    pub kernel_hash: Hash,
    /// Digest of the parameter schema for parameterized kernels.
    pub params_schema_digest: Hash,
    kernel: Arc<dyn Kernel>,
}

impl RegisteredKernel {
    /// The kernel implementation.
    #[must_use]
    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }
}

impl std::fmt::Debug for RegisteredKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredKernel")
            .field("kernel_hash", &hex::encode(self.kernel_hash))
            .finish_non_exhaustive()
    }
}

/// Errors produced by the kernel registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A kernel id was registered twice.
    #[error("duplicate kernel id: {0}")]
    DuplicateKernel(String),
    /// Lookup of an unregistered kernel id.
    #[error("unknown kernel id: {0}")]
    UnknownKernel(String),
}

/// Allowlist of kernels keyed by stable id.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<String, RegisteredKernel>,
}

impl KernelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the builtin kernels.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        // Ids are distinct literals; registration cannot collide.
        let _ = reg.register("kern.set_field.v1", Arc::new(SetFieldKernel));
        let _ = reg.register("kern.add_field.v1", Arc::new(AddFieldKernel));
        let _ = reg.register("kern.scale_field.v1", Arc::new(ScaleFieldKernel));
        let _ = reg.register("kern.clear_field.v1", Arc::new(ClearFieldKernel));
        reg
    }

    /// Registers a kernel under `id`, hashing its body descriptor.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Hash, RegistryError> {
        let id = id.into();
        if self.kernels.contains_key(&id) {
            return Err(RegistryError::DuplicateKernel(id));
        }
        let descriptor = kernel.body_descriptor();
        let kernel_hash = sha3_256(format!("kernel:{id}:{descriptor}").as_bytes());
        let params_schema_digest =
            sha3_256(format!("kernel-params:{id}:{descriptor}").as_bytes());
        self.kernels.insert(
            id,
            RegisteredKernel {
                kernel_hash,
                params_schema_digest,
                kernel,
            },
        );
        Ok(kernel_hash)
    }

    /// Looks up a registered kernel.
    pub fn lookup(&self, id: &str) -> Result<&RegisteredKernel, RegistryError> {
        self.kernels
            .get(id)
            .ok_or_else(|| RegistryError::UnknownKernel(id.to_owned()))
    }

    /// Registry digest: SHA3-256 over the sorted id → hash mapping.
    #[must_use]
    pub fn digest(&self) -> Hash {
        let entries: Vec<Json> = self
            .kernels
            .iter()
            .map(|(id, k)| {
                json!([
                    format!("id:{id}"),
                    hash_to_wire(&k.kernel_hash),
                    hash_to_wire(&k.params_schema_digest),
                ])
            })
            .collect();
        canon::digest(&Json::Array(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u8) -> FieldId {
        let mut raw = [0u8; 16];
        raw[15] = n;
        FieldId(raw)
    }

    fn params(entries: &[(&str, Value)]) -> Params {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn set_field_writes_the_value() {
        let view = State::new("schema.test.v1");
        let p = params(&[
            ("field", Value::Str(fid(1).to_hex())),
            ("value", Value::Quantum(DebtUnit::from_raw(50_000))),
        ]);
        let out = SetFieldKernel.run(&view, &p).unwrap();
        assert_eq!(
            out.get(&fid(1)),
            Some(&Value::Quantum(DebtUnit::from_raw(50_000)))
        );
    }

    #[test]
    fn add_field_reads_missing_as_zero() {
        let view = State::new("schema.test.v1");
        let p = params(&[
            ("field", Value::Str(fid(1).to_hex())),
            ("amount", Value::Quantum(DebtUnit::from_raw(7))),
        ]);
        let out = AddFieldKernel.run(&view, &p).unwrap();
        assert_eq!(out.get(&fid(1)), Some(&Value::Quantum(DebtUnit::from_raw(7))));
    }

    #[test]
    fn scale_field_rounds_half_even() {
        let mut fields = BTreeMap::new();
        fields.insert(fid(1), Value::Quantum(DebtUnit::from_raw(5)));
        let view = State::with_fields("schema.test.v1", fields);
        let p = params(&[
            ("field", Value::Str(fid(1).to_hex())),
            ("num", Value::int(1)),
            ("den", Value::int(2)),
        ]);
        // 5/2 rounds to 2 (ties to even).
        let out = ScaleFieldKernel.run(&view, &p).unwrap();
        assert_eq!(out.get(&fid(1)), Some(&Value::Quantum(DebtUnit::from_raw(2))));
        let p = params(&[
            ("field", Value::Str(fid(1).to_hex())),
            ("num", Value::int(1)),
            ("den", Value::int(0)),
        ]);
        assert_eq!(
            ScaleFieldKernel.run(&view, &p),
            Err(KernelError::NonPositiveDivisor)
        );
    }

    #[test]
    fn non_numeric_operand_is_a_kernel_error() {
        let mut fields = BTreeMap::new();
        fields.insert(fid(1), Value::text("not a number"));
        let view = State::with_fields("schema.test.v1", fields);
        let p = params(&[
            ("field", Value::Str(fid(1).to_hex())),
            ("amount", Value::Quantum(DebtUnit::from_raw(1))),
        ]);
        assert_eq!(
            AddFieldKernel.run(&view, &p),
            Err(KernelError::NonNumericField)
        );
    }

    #[test]
    fn registry_digest_commits_to_membership() {
        let full = KernelRegistry::builtin();
        let mut partial = KernelRegistry::new();
        let _ = partial
            .register("kern.set_field.v1", Arc::new(SetFieldKernel))
            .unwrap();
        assert_ne!(full.digest(), partial.digest());
        assert_eq!(full.digest(), KernelRegistry::builtin().digest());
        assert!(full.lookup("kern.add_field.v1").is_ok());
        assert!(matches!(
            full.lookup("kern.bogus.v1"),
            Err(RegistryError::UnknownKernel(_))
        ));
    }

    #[test]
    fn duplicate_registration_rejects() {
        let mut reg = KernelRegistry::builtin();
        assert!(matches!(
            reg.register("kern.set_field.v1", Arc::new(SetFieldKernel)),
            Err(RegistryError::DuplicateKernel(_))
        ));
    }
}
