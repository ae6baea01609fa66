// program.rs — Loop-nest dataflow program representation
//
// Operations live in an arena addressed by `OpId`. Each operation has an
// iteration domain, operands (value + mapping from its own domain to the
// producer's domain), typed results, and the three lowering attributes this
// crate infers: loop nest, sequence number and per-result storage.
//
// Preconditions: none (types only, plus structural verification).
// Postconditions: `verify_structure` returns no errors for programs the
//                 analyses can consume.
// Failure modes: E0001 diagnostics from `verify_structure`.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, Diagnostic, Location};
use crate::id::{OpId, ValueRef};
use crate::mapping::MappingExpr;

// ── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    F32,
    F64,
    I32,
    I64,
    Index,
}

/// One dimension of an iteration domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDim {
    /// Name of the extent (a range value in the full IR).
    pub range: String,
    /// Earlier dimensions of the same domain the extent depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<usize>,
}

impl DomainDim {
    pub fn new(range: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn dependent(range: impl Into<String>, depends_on: Vec<usize>) -> Self {
        Self {
            range: range.into(),
            depends_on,
        }
    }
}

/// Use of a value: the mapping has one expression per producer dimension,
/// each over the consumer's domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub value: ValueRef,
    pub mapping: Vec<MappingExpr>,
}

/// One `(name, iter)` entry of a loop nest attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopAttr {
    pub name: String,
    pub iter: MappingExpr,
}

impl LoopAttr {
    pub fn new(name: impl Into<String>, iter: MappingExpr) -> Self {
        Self {
            name: name.into(),
            iter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySpace {
    Register,
    Memory,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Register => write!(f, "register"),
            MemorySpace::Memory => write!(f, "memory"),
        }
    }
}

/// A layout keyed by loop names: `exprs[k]` gives the loop (as an index into
/// `names`) that indexes buffer dimension `k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedMapping {
    pub names: Vec<String>,
    pub exprs: Vec<MappingExpr>,
}

impl fmt::Display for NamedMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exprs: Vec<String> = self.exprs.iter().map(|e| e.to_string()).collect();
        write!(f, "({}) -> ({})", self.names.join(", "), exprs.join(", "))
    }
}

/// Storage attribute of one result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAttr {
    pub space: MemorySpace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<NamedMapping>,
}

// ── Operations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Scheduled operation, lowered to loops.
    Compute,
    /// Reads an external buffer; its single result lives in that buffer.
    FromMemref { buffer: String },
    /// Stores its single operand into an external buffer.
    ToMemref { buffer: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: OpKind,
    pub domain: Vec<DomainDim>,
    #[serde(default)]
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub results: Vec<ElementType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_nest: Option<Vec<LoopAttr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    /// Either empty (nothing specified) or one entry per result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<Option<BufferAttr>>,
}

impl Operation {
    fn with_kind(kind: OpKind, domain: Vec<DomainDim>) -> Self {
        Self {
            name: None,
            kind,
            domain,
            operands: Vec::new(),
            results: Vec::new(),
            loop_nest: None,
            sequence: None,
            storage: Vec::new(),
        }
    }

    /// A compute operation producing one `f32` result.
    pub fn compute(domain: Vec<DomainDim>) -> Self {
        let mut op = Self::with_kind(OpKind::Compute, domain);
        op.results.push(ElementType::F32);
        op
    }

    pub fn from_memref(buffer: impl Into<String>, domain: Vec<DomainDim>) -> Self {
        let mut op = Self::with_kind(
            OpKind::FromMemref {
                buffer: buffer.into(),
            },
            domain,
        );
        op.results.push(ElementType::F32);
        op
    }

    pub fn to_memref(buffer: impl Into<String>, domain: Vec<DomainDim>, operand: Operand) -> Self {
        let mut op = Self::with_kind(
            OpKind::ToMemref {
                buffer: buffer.into(),
            },
            domain,
        );
        op.operands.push(operand);
        op
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_operand(mut self, value: ValueRef, mapping: Vec<MappingExpr>) -> Self {
        self.operands.push(Operand { value, mapping });
        self
    }

    pub fn with_results(mut self, results: Vec<ElementType>) -> Self {
        self.results = results;
        self
    }

    pub fn with_loop_nest(mut self, loops: Vec<LoopAttr>) -> Self {
        self.loop_nest = Some(loops);
        self
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_storage(mut self, storage: Vec<Option<BufferAttr>>) -> Self {
        self.storage = storage;
        self
    }

    pub fn is_compute(&self) -> bool {
        self.kind == OpKind::Compute
    }

    pub fn domain_size(&self) -> usize {
        self.domain.len()
    }

    /// Storage attribute of `result`, if any.
    pub fn storage_attr(&self, result: usize) -> Option<&BufferAttr> {
        self.storage.get(result).and_then(Option::as_ref)
    }

    /// Loop names of the loop nest attribute, empty if absent.
    pub fn loop_names(&self) -> impl Iterator<Item = &str> {
        self.loop_nest
            .iter()
            .flat_map(|nest| nest.iter().map(|l| l.name.as_str()))
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("-")
    }
}

// ── Program and module ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(default)]
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Module {
    pub programs: Vec<Program>,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
        }
    }

    /// Append an operation and return its id.
    pub fn add(&mut self, op: Operation) -> OpId {
        self.ops.push(op);
        OpId((self.ops.len() - 1) as u32)
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.index()]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operation {
        &mut self.ops[id.index()]
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len() as u32).map(OpId)
    }

    pub fn element_type(&self, value: ValueRef) -> ElementType {
        self.op(value.op).results[value.result]
    }

    /// SHA-256 (hex) of the canonical JSON of every lowering attribute.
    pub fn attribute_fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        #[derive(Serialize)]
        struct Attributes<'a> {
            loop_nest: &'a Option<Vec<LoopAttr>>,
            sequence: Option<i64>,
            storage: &'a [Option<BufferAttr>],
        }

        let attrs: Vec<Attributes<'_>> = self
            .ops
            .iter()
            .map(|op| Attributes {
                loop_nest: &op.loop_nest,
                sequence: op.sequence,
                storage: &op.storage,
            })
            .collect();
        // Serializing plain structs of strings and integers cannot fail.
        let canonical = serde_json::to_string(&attrs).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        bytes_to_hex(&hasher.finalize())
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {}", self.name)?;
        for (i, op) in self.ops.iter().enumerate() {
            let kind = match &op.kind {
                OpKind::Compute => "compute".to_string(),
                OpKind::FromMemref { buffer } => format!("from_memref {}", buffer),
                OpKind::ToMemref { buffer } => format!("to_memref {}", buffer),
            };
            write!(f, "  #{} {} {} rank={}", i, op.label(), kind, op.domain_size())?;
            if let Some(seq) = op.sequence {
                write!(f, " seq={}", seq)?;
            }
            if let Some(nest) = &op.loop_nest {
                let loops: Vec<String> =
                    nest.iter().map(|l| format!("{}:{}", l.name, l.iter)).collect();
                write!(f, " loops=[{}]", loops.join(", "))?;
            }
            writeln!(f)?;
            for (r, storage) in op.storage.iter().enumerate() {
                let Some(attr) = storage else { continue };
                write!(f, "    %{}#{} {}", i, r, attr.space)?;
                if let Some(name) = &attr.name {
                    write!(f, " {}", name)?;
                }
                if let Some(layout) = &attr.layout {
                    write!(f, " {}", layout)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

// ── Structural verification ─────────────────────────────────────────────────

/// Check the structural well-formedness every analysis relies on.
///
/// Reports E0001 for dangling operands, operand mappings of the wrong arity
/// or referencing dimensions outside the consumer domain, forward
/// `depends_on` references, attributes on non-compute operations and memref
/// operations with the wrong operand/result counts.
pub fn verify_structure(program: &Program) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for id in program.op_ids() {
        let op = program.op(id);
        let at = Location::Op(id);

        for (d, dim) in op.domain.iter().enumerate() {
            if let Some(&bad) = dim.depends_on.iter().find(|&&dep| dep >= d) {
                diags.push(Diagnostic::error(
                    codes::E0001,
                    at,
                    format!(
                        "domain dimension {} depends on dimension {}, which is not an earlier dimension",
                        d, bad
                    ),
                ));
            }
        }

        for (index, operand) in op.operands.iter().enumerate() {
            let loc = Location::Operand { op: id, index };
            let Some(producer) = program.ops.get(operand.value.op.index()) else {
                diags.push(Diagnostic::error(
                    codes::E0001,
                    loc,
                    format!("operand refers to missing {}", operand.value.op),
                ));
                continue;
            };
            if operand.value.result >= producer.results.len() {
                diags.push(Diagnostic::error(
                    codes::E0001,
                    loc,
                    format!(
                        "operand refers to result #{} of {}, which has {} result(s)",
                        operand.value.result,
                        operand.value.op,
                        producer.results.len()
                    ),
                ));
            }
            if operand.mapping.len() != producer.domain_size() {
                diags.push(Diagnostic::error(
                    codes::E0001,
                    loc,
                    format!(
                        "operand mapping has {} expression(s) but the producer domain has {} dimension(s)",
                        operand.mapping.len(),
                        producer.domain_size()
                    ),
                ));
            }
            for expr in &operand.mapping {
                if let Some(d) = expr.dims().find(|&d| d >= op.domain_size()) {
                    diags.push(Diagnostic::error(
                        codes::E0001,
                        loc,
                        format!("operand mapping references d{} outside the domain", d),
                    ));
                }
                if expr.is_unknown() {
                    diags.push(Diagnostic::error(
                        codes::E0001,
                        loc,
                        "operand mapping must be fully specified",
                    ));
                }
            }
        }

        if !op.storage.is_empty() && op.storage.len() != op.results.len() {
            diags.push(Diagnostic::error(
                codes::E0001,
                at,
                format!(
                    "{} storage attribute(s) for {} result(s)",
                    op.storage.len(),
                    op.results.len()
                ),
            ));
        }

        let (operands, results) = match &op.kind {
            OpKind::Compute => continue,
            OpKind::FromMemref { .. } => (0, 1),
            OpKind::ToMemref { .. } => (1, 0),
        };
        if op.loop_nest.is_some() || op.sequence.is_some() || !op.storage.is_empty() {
            diags.push(
                Diagnostic::error(
                    codes::E0001,
                    at,
                    "only compute operations carry loop nest, sequence or storage attributes",
                )
                .with_hint("remove the attributes from the memref operation"),
            );
        }
        if op.operands.len() != operands || op.results.len() != results {
            diags.push(Diagnostic::error(
                codes::E0001,
                at,
                format!(
                    "memref operation expects {} operand(s) and {} result(s)",
                    operands, results
                ),
            ));
        }
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use MappingExpr::Dim;

    fn two_op_program() -> Program {
        let mut p = Program::new("demo");
        let a = p.add(
            Operation::compute(vec![DomainDim::new("N"), DomainDim::new("M")]).with_name("A"),
        );
        p.add(
            Operation::compute(vec![DomainDim::new("N"), DomainDim::new("M")])
                .with_name("B")
                .with_operand(ValueRef::new(a, 0), vec![Dim(0), Dim(1)]),
        );
        p
    }

    #[test]
    fn well_formed_program_has_no_diagnostics() {
        let diags = verify_structure(&two_op_program());
        assert!(diags.is_empty(), "unexpected: {:?}", diags);
    }

    #[test]
    fn operand_arity_and_range_are_checked() {
        let mut p = two_op_program();
        p.op_mut(OpId(1)).operands[0].mapping = vec![Dim(2)];
        let diags = verify_structure(&p);
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.code == Some(codes::E0001)));
    }

    #[test]
    fn dangling_operand_is_reported() {
        let mut p = two_op_program();
        p.op_mut(OpId(1)).operands[0].value = ValueRef::new(OpId(9), 0);
        let diags = verify_structure(&p);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("missing op #9"));
    }

    #[test]
    fn forward_dependency_is_reported() {
        let mut p = Program::new("dep");
        p.add(Operation::compute(vec![
            DomainDim::dependent("N", vec![1]),
            DomainDim::new("M"),
        ]));
        assert_eq!(verify_structure(&p).len(), 1);
    }

    #[test]
    fn memref_ops_cannot_carry_attributes() {
        let mut p = Program::new("memref");
        p.add(Operation::from_memref("in", vec![DomainDim::new("N")]).with_sequence(0));
        let diags = verify_structure(&p);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].hint.is_some());
    }

    #[test]
    fn json_shape() {
        let json = serde_json::json!({
            "name": "p",
            "ops": [
                { "kind": "from_memref", "buffer": "in", "domain": [{ "range": "N" }],
                  "results": ["f32"] },
                { "kind": "compute", "name": "A", "domain": [{ "range": "N" }],
                  "operands": [{ "value": { "op": 0, "result": 0 }, "mapping": ["d0"] }],
                  "results": ["f32"],
                  "loop_nest": [{ "name": "i", "iter": "d0" }],
                  "storage": [{ "space": "memory", "name": "buf",
                                "layout": { "names": ["i"], "exprs": ["d0"] } }] }
            ]
        });
        let p: Program = serde_json::from_value(json).unwrap();
        assert_eq!(
            p.op(OpId(0)).kind,
            OpKind::FromMemref {
                buffer: "in".into()
            }
        );
        assert!(p.op(OpId(1)).is_compute());
        let attr = p.op(OpId(1)).storage_attr(0).unwrap();
        assert_eq!(attr.space, MemorySpace::Memory);
        assert_eq!(attr.layout.as_ref().unwrap().to_string(), "(i) -> (d0)");

        let back: Program = serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn fingerprint_tracks_attributes_only() {
        let p = two_op_program();
        let mut renamed = p.clone();
        renamed.name = "other".into();
        assert_eq!(p.attribute_fingerprint(), renamed.attribute_fingerprint());
        assert_eq!(p.attribute_fingerprint().len(), 64);

        let mut sequenced = p.clone();
        sequenced.op_mut(OpId(0)).sequence = Some(0);
        assert_ne!(p.attribute_fingerprint(), sequenced.attribute_fingerprint());
    }

    #[test]
    fn display_summary() {
        let mut p = two_op_program();
        p.op_mut(OpId(0)).sequence = Some(0);
        p.op_mut(OpId(0)).loop_nest = Some(vec![LoopAttr::new("i", Dim(0))]);
        p.op_mut(OpId(0)).storage = vec![Some(BufferAttr {
            space: MemorySpace::Register,
            name: None,
            layout: Some(NamedMapping {
                names: vec![],
                exprs: vec![],
            }),
        })];
        assert_eq!(
            p.to_string(),
            "program demo\n  #0 A compute rank=2 seq=0 loops=[i:d0]\n    %0#0 register () -> ()\n  #1 B compute rank=2\n"
        );
    }
}
