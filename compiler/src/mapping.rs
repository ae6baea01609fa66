// mapping.rs — Dimension-mapping expression algebra
//
// A `Mapping` relates two domains. It is attached to the *use* domain and
// holds one expression per dimension of the *defined* domain, each expression
// saying which use-domain dimension provides the index (`dN`), that the
// correspondence is not resolved yet (`?`), or that there is none (`none`).
// Strip-mined loops index one strip of a dimension
// (`stripe(dN, [f0, .., fk])`); `unstripe(dA, .., dZ, [f0, .., 1])` rebuilds
// a dimension from all its strips.
//
// Operand mappings go from the consumer domain to the producer domain; loop
// nests map the operation domain to loops; layouts map an iteration space to
// buffer dimensions.
//
// Preconditions: expressions only reference dimensions of the use domain
//                (enforced by `Mapping::new`); strip-mining factors are
//                strictly decreasing (enforced by `MappingExpr::stripe` and
//                `MappingExpr::unstripe`).
// Postconditions: every operation returns a well-formed mapping.
// Failure modes: `unify` returns `None` on conflicting concrete expressions;
//                arity mismatches in `compose` are programmer errors (panic).
// Side effects: none.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Strip-mining factors ────────────────────────────────────────────────────

/// Maximum number of strip-mining levels of one dimension.
pub const MAX_STRIPE_DEPTH: usize = 4;

/// Short list of integers stored inline so that expressions stay `Copy`.
/// Holds the factors of a stripe and the operands of an unstripe.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StripeList {
    len: u8,
    items: [u32; MAX_STRIPE_DEPTH],
}

impl StripeList {
    fn new(items: &[usize]) -> Result<Self, MappingError> {
        if items.is_empty() || items.len() > MAX_STRIPE_DEPTH {
            return Err(MappingError::Stripe(format!(
                "expected 1 to {} strip-mining levels, got {}",
                MAX_STRIPE_DEPTH,
                items.len()
            )));
        }
        let mut list = Self {
            len: items.len() as u8,
            items: [0; MAX_STRIPE_DEPTH],
        };
        for (slot, &item) in list.items.iter_mut().zip(items) {
            *slot = u32::try_from(item)
                .map_err(|_| MappingError::Stripe(format!("{} is too large", item)))?;
        }
        Ok(list)
    }

    fn decreasing_factors(items: &[usize]) -> Result<Self, MappingError> {
        if items.contains(&0) || items.windows(2).any(|w| w[0] <= w[1]) {
            return Err(MappingError::Stripe(format!(
                "factors [{}] must be positive and strictly decreasing",
                join(items.iter())
            )));
        }
        Self::new(items)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.items[..self.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.as_slice().iter().map(|&x| x as usize)
    }

    pub fn get(&self, i: usize) -> usize {
        self.as_slice()[i] as usize
    }

    pub fn last(&self) -> usize {
        self.get(self.len() - 1)
    }

    /// The first `n` items (`1 <= n <= len`).
    pub fn prefix(&self, n: usize) -> StripeList {
        assert!(n >= 1 && n <= self.len(), "invalid stripe prefix length {}", n);
        let mut list = *self;
        list.len = n as u8;
        for slot in &mut list.items[n..] {
            *slot = 0;
        }
        list
    }

    pub fn starts_with(&self, other: &StripeList) -> bool {
        self.as_slice().starts_with(other.as_slice())
    }

    fn map(self, f: impl Fn(usize) -> usize) -> StripeList {
        let mut list = self;
        for slot in &mut list.items[..self.len()] {
            *slot = f(*slot as usize) as u32;
        }
        list
    }
}

impl fmt::Debug for StripeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

fn join(items: impl Iterator<Item = impl fmt::Display>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

// ── Expressions ─────────────────────────────────────────────────────────────

/// One dimension of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MappingExpr {
    /// Index taken from dimension `n` of the use domain.
    Dim(usize),
    /// Strip `factors.len() - 1` of use dimension `dim`: steps of the last
    /// factor inside tiles of the previous one (the whole range for a single
    /// factor).
    Stripe { dim: usize, factors: StripeList },
    /// Index rebuilt from one strip per factor; the last factor is 1.
    Unstripe { dims: StripeList, factors: StripeList },
    /// Not resolved yet; may be refined by unification.
    Unknown,
    /// No use-domain dimension provides this index.
    None,
}

impl MappingExpr {
    pub fn stripe(dim: usize, factors: &[usize]) -> Result<Self, MappingError> {
        Ok(MappingExpr::Stripe {
            dim,
            factors: StripeList::decreasing_factors(factors)?,
        })
    }

    pub fn unstripe(dims: &[usize], factors: &[usize]) -> Result<Self, MappingError> {
        if dims.len() != factors.len() || factors.last() != Some(&1) {
            return Err(MappingError::Stripe(format!(
                "unstripe needs one operand per factor and a last factor of 1, got [{}] and [{}]",
                join(dims.iter()),
                join(factors.iter())
            )));
        }
        Ok(MappingExpr::Unstripe {
            dims: StripeList::new(dims)?,
            factors: StripeList::decreasing_factors(factors)?,
        })
    }

    /// Unify two expressions. `?` refines to anything; any other expression
    /// only unifies with itself.
    pub fn unify(self, other: MappingExpr) -> Option<MappingExpr> {
        match (self, other) {
            (MappingExpr::Unknown, e) | (e, MappingExpr::Unknown) => Some(e),
            _ if self == other => Some(self),
            _ => None,
        }
    }

    /// Replace `dN` with `exprs[N]`.
    pub fn substitute(self, exprs: &[MappingExpr]) -> MappingExpr {
        match self {
            MappingExpr::Dim(d) => exprs[d],
            MappingExpr::Stripe { dim, factors } => match exprs[dim] {
                MappingExpr::Dim(d) => MappingExpr::Stripe { dim: d, factors },
                // A strip of a rebuilt dimension is one of its operands.
                MappingExpr::Unstripe {
                    dims,
                    factors: full,
                } if full.starts_with(&factors) => MappingExpr::Dim(dims.get(factors.len() - 1)),
                MappingExpr::None => MappingExpr::None,
                _ => MappingExpr::Unknown,
            },
            MappingExpr::Unstripe { dims, factors } => {
                let operands: Vec<MappingExpr> = dims.iter().map(|d| exprs[d]).collect();
                if operands.contains(&MappingExpr::None) {
                    return MappingExpr::None;
                }
                if operands.iter().all(|e| e.as_dim().is_some()) {
                    return MappingExpr::Unstripe {
                        dims: dims.map(|d| exprs[d].as_dim().unwrap_or(d)),
                        factors,
                    };
                }
                // Rebuilding every strip of a dimension gives the dimension.
                if let MappingExpr::Stripe { dim, .. } = operands[0] {
                    let whole = operands.iter().enumerate().all(|(level, e)| {
                        *e == MappingExpr::Stripe {
                            dim,
                            factors: factors.prefix(level + 1),
                        }
                    });
                    if whole {
                        return MappingExpr::Dim(dim);
                    }
                }
                MappingExpr::Unknown
            }
            other => other,
        }
    }

    pub fn as_dim(self) -> Option<usize> {
        match self {
            MappingExpr::Dim(d) => Some(d),
            _ => None,
        }
    }

    /// Use-domain dimensions the expression reads.
    pub fn dims(&self) -> impl Iterator<Item = usize> + '_ {
        let (single, list): (Option<usize>, &[u32]) = match self {
            MappingExpr::Dim(d) | MappingExpr::Stripe { dim: d, .. } => (Some(*d), &[]),
            MappingExpr::Unstripe { dims, .. } => (None, dims.as_slice()),
            _ => (None, &[]),
        };
        single.into_iter().chain(list.iter().map(|&d| d as usize))
    }

    fn map_dims(self, f: impl Fn(usize) -> usize) -> MappingExpr {
        match self {
            MappingExpr::Dim(d) => MappingExpr::Dim(f(d)),
            MappingExpr::Stripe { dim, factors } => MappingExpr::Stripe {
                dim: f(dim),
                factors,
            },
            MappingExpr::Unstripe { dims, factors } => MappingExpr::Unstripe {
                dims: dims.map(f),
                factors,
            },
            other => other,
        }
    }

    pub fn is_unknown(self) -> bool {
        self == MappingExpr::Unknown
    }
}

impl fmt::Display for MappingExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingExpr::Dim(d) => write!(f, "d{}", d),
            MappingExpr::Stripe { dim, factors } => {
                write!(f, "stripe(d{}, [{}])", dim, join(factors.iter()))
            }
            MappingExpr::Unstripe { dims, factors } => write!(
                f,
                "unstripe({}, [{}])",
                join(dims.iter().map(|d| format!("d{}", d))),
                join(factors.iter())
            ),
            MappingExpr::Unknown => write!(f, "?"),
            MappingExpr::None => write!(f, "none"),
        }
    }
}

fn parse_dim(s: &str) -> Result<usize, MappingError> {
    s.trim()
        .strip_prefix('d')
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| MappingError::Parse(s.trim().to_string()))
}

/// Split the body of `stripe(..)`/`unstripe(..)` into its operands and its
/// factor list.
fn parse_call_body(whole: &str, body: &str) -> Result<(Vec<usize>, Vec<usize>), MappingError> {
    let parse_err = || MappingError::Parse(whole.to_string());
    let open = body.find('[').ok_or_else(parse_err)?;
    let close = body.rfind(']').ok_or_else(parse_err)?;
    if close < open || !body[close + 1..].trim().is_empty() {
        return Err(parse_err());
    }
    let operands = body[..open].trim().strip_suffix(',').ok_or_else(parse_err)?;
    let dims = operands
        .split(',')
        .map(parse_dim)
        .collect::<Result<Vec<_>, _>>()?;
    let factors = body[open + 1..close]
        .split(',')
        .map(|f| f.trim().parse::<usize>().map_err(|_| parse_err()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((dims, factors))
}

impl FromStr for MappingExpr {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(body) = s.strip_prefix("stripe(").and_then(|r| r.strip_suffix(')')) {
            let (dims, factors) = parse_call_body(s, body)?;
            return match dims.as_slice() {
                [dim] => MappingExpr::stripe(*dim, &factors),
                _ => Err(MappingError::Parse(s.to_string())),
            };
        }
        if let Some(body) = s.strip_prefix("unstripe(").and_then(|r| r.strip_suffix(')')) {
            let (dims, factors) = parse_call_body(s, body)?;
            return MappingExpr::unstripe(&dims, &factors);
        }
        match s {
            "?" => Ok(MappingExpr::Unknown),
            "none" => Ok(MappingExpr::None),
            _ => parse_dim(s).map(MappingExpr::Dim),
        }
    }
}

impl TryFrom<String> for MappingExpr {
    type Error = MappingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MappingExpr> for String {
    fn from(expr: MappingExpr) -> String {
        expr.to_string()
    }
}

/// Split at commas outside of parentheses and brackets.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// The `unstripe` rebuilding use dimension `dim` from the stripes of `exprs`,
/// if they cover every strip of it.
fn stripe_chain(exprs: &[MappingExpr], dim: usize) -> Option<MappingExpr> {
    let strips: Vec<(usize, StripeList)> = exprs
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            MappingExpr::Stripe { dim: d, factors } if *d == dim => Some((i, *factors)),
            _ => None,
        })
        .collect();
    let full = strips.iter().map(|(_, f)| *f).max_by_key(|f| f.len())?;
    if full.last() != 1 {
        return None;
    }
    let mut dims = Vec::with_capacity(full.len());
    for level in 0..full.len() {
        let level_factors = full.prefix(level + 1);
        let (i, _) = strips.iter().find(|(_, f)| *f == level_factors)?;
        dims.push(*i);
    }
    let factors: Vec<usize> = full.iter().collect();
    MappingExpr::unstripe(&dims, &factors).ok()
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// An expression references a dimension outside the use domain.
    DimOutOfRange { dim: usize, use_domain_size: usize },
    /// Text is not `dN`, `?`, `none`, `stripe(..)` or `unstripe(..)`.
    Parse(String),
    /// Malformed strip-mining factors or operands.
    Stripe(String),
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::DimOutOfRange {
                dim,
                use_domain_size,
            } => write!(
                f,
                "dimension d{} is out of range for a domain of {} dimension(s)",
                dim, use_domain_size
            ),
            MappingError::Parse(s) => write!(
                f,
                "invalid mapping expression '{}' (expected dN, ?, none, stripe(..) or unstripe(..))",
                s
            ),
            MappingError::Stripe(msg) => write!(f, "invalid strip-mining: {}", msg),
        }
    }
}

impl std::error::Error for MappingError {}

// ── Mapping ─────────────────────────────────────────────────────────────────

/// A mapping from a use domain of `use_domain_size` dimensions to a domain of
/// `size()` dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    use_domain_size: usize,
    exprs: Vec<MappingExpr>,
}

impl Mapping {
    /// Build a mapping, rejecting expressions that reference dimensions
    /// outside the use domain.
    pub fn new(use_domain_size: usize, exprs: Vec<MappingExpr>) -> Result<Self, MappingError> {
        if let Some(dim) = exprs
            .iter()
            .flat_map(|e| e.dims())
            .find(|&d| d >= use_domain_size)
        {
            return Err(MappingError::DimOutOfRange {
                dim,
                use_domain_size,
            });
        }
        Ok(Self {
            use_domain_size,
            exprs,
        })
    }

    /// Parse a comma-separated list of expressions (`"d0, ?, none"`).
    pub fn parse(use_domain_size: usize, text: &str) -> Result<Self, MappingError> {
        let exprs = if text.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(text)
                .into_iter()
                .map(str::parse)
                .collect::<Result<Vec<_>, _>>()?
        };
        Self::new(use_domain_size, exprs)
    }

    pub(crate) fn from_parts(use_domain_size: usize, exprs: Vec<MappingExpr>) -> Self {
        debug_assert!(exprs
            .iter()
            .flat_map(|e| e.dims())
            .all(|d| d < use_domain_size));
        Self {
            use_domain_size,
            exprs,
        }
    }

    pub fn identity(n: usize) -> Self {
        Self::from_parts(n, (0..n).map(MappingExpr::Dim).collect())
    }

    /// A mapping with no defined dimensions.
    pub fn empty(use_domain_size: usize) -> Self {
        Self::from_parts(use_domain_size, Vec::new())
    }

    /// A mapping whose every expression is `?`.
    pub fn unknown(use_domain_size: usize, size: usize) -> Self {
        Self::from_parts(use_domain_size, vec![MappingExpr::Unknown; size])
    }

    pub fn use_domain_size(&self) -> usize {
        self.use_domain_size
    }

    pub fn size(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn exprs(&self) -> &[MappingExpr] {
        &self.exprs
    }

    pub fn expr(&self, i: usize) -> MappingExpr {
        self.exprs[i]
    }

    pub fn is_identity(&self) -> bool {
        self.use_domain_size == self.exprs.len()
            && self
                .exprs
                .iter()
                .enumerate()
                .all(|(i, e)| *e == MappingExpr::Dim(i))
    }

    /// No `?` expression remains.
    pub fn is_fully_specified(&self) -> bool {
        !self.exprs.iter().any(|e| e.is_unknown())
    }

    /// Every defined dimension is provided by a distinct use dimension.
    pub fn is_surjective(&self) -> bool {
        let mut seen = vec![false; self.use_domain_size];
        for expr in &self.exprs {
            match expr {
                MappingExpr::Dim(d) if !seen[*d] => seen[*d] = true,
                _ => return false,
            }
        }
        true
    }

    /// Use-domain dimensions referenced by at least one expression.
    pub fn dependency_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.use_domain_size];
        for d in self.exprs.iter().flat_map(|e| e.dims()) {
            mask[d] = true;
        }
        mask
    }

    /// Number of leading use-domain dimensions the mapping depends on.
    pub fn min_domain_size(&self) -> usize {
        self.exprs
            .iter()
            .flat_map(|e| e.dims())
            .map(|d| d + 1)
            .max()
            .unwrap_or(0)
    }

    /// Chain `self` (A → B) with `other` (B → C) into A → C.
    pub fn compose(&self, other: &Mapping) -> Mapping {
        assert_eq!(
            other.use_domain_size,
            self.size(),
            "cannot compose {} with {}",
            self,
            other
        );
        let exprs = other.exprs.iter().map(|e| e.substitute(&self.exprs)).collect();
        Self::from_parts(self.use_domain_size, exprs)
    }

    /// Inverse mapping (B → A). Use dimensions not referenced become `?`; when
    /// several defined dimensions share a use dimension the first one wins.
    /// A use dimension only reached through stripes is rebuilt with an
    /// `unstripe` when every strip of it is present, and stays `?` otherwise.
    pub fn inverse(&self) -> Mapping {
        let mut exprs = vec![MappingExpr::Unknown; self.use_domain_size];
        for (i, expr) in self.exprs.iter().enumerate() {
            if let MappingExpr::Dim(d) = expr {
                if exprs[*d].is_unknown() {
                    exprs[*d] = MappingExpr::Dim(i);
                }
            }
        }
        for (d, slot) in exprs.iter_mut().enumerate() {
            if slot.is_unknown() {
                if let Some(rebuilt) = stripe_chain(&self.exprs, d) {
                    *slot = rebuilt;
                }
            }
        }
        Self::from_parts(self.exprs.len(), exprs)
    }

    /// Unify two mappings of the same shape expression by expression.
    pub fn unify(&self, other: &Mapping) -> Option<Mapping> {
        if self.use_domain_size != other.use_domain_size || self.size() != other.size() {
            return None;
        }
        let exprs = self
            .exprs
            .iter()
            .zip(&other.exprs)
            .map(|(a, b)| a.unify(*b))
            .collect::<Option<Vec<_>>>()?;
        Some(Self::from_parts(self.use_domain_size, exprs))
    }

    /// Truncate to `n` expressions, or pad with `?`.
    pub fn resize(&self, n: usize) -> Mapping {
        let mut exprs = self.exprs.clone();
        exprs.resize(n, MappingExpr::Unknown);
        Self::from_parts(self.use_domain_size, exprs)
    }

    /// Same expressions over a larger use domain.
    pub fn extend_use_domain(&self, n: usize) -> Mapping {
        assert!(n >= self.use_domain_size, "use domain can only grow");
        Self::from_parts(n, self.exprs.clone())
    }

    /// Prepend `offset` dimensions to the use domain.
    pub fn shift_right(&self, offset: usize) -> Mapping {
        let exprs = self
            .exprs
            .iter()
            .map(|e| e.map_dims(|d| d + offset))
            .collect();
        Self::from_parts(self.use_domain_size + offset, exprs)
    }

    pub fn add_prefix(&self, prefix: &[MappingExpr]) -> Mapping {
        let mut exprs = prefix.to_vec();
        exprs.extend_from_slice(&self.exprs);
        self.checked(exprs)
    }

    pub fn add_suffix(&self, suffix: &[MappingExpr]) -> Mapping {
        let mut exprs = self.exprs.clone();
        exprs.extend_from_slice(suffix);
        self.checked(exprs)
    }

    /// Remove the first `n` expressions.
    pub fn drop_front(&self, n: usize) -> Mapping {
        Self::from_parts(self.use_domain_size, self.exprs[n..].to_vec())
    }

    /// Replace every `?` and `none` expression with a fresh use-domain
    /// dimension, appended after the existing ones.
    pub fn make_surjective(&self) -> Mapping {
        let mut next = self.use_domain_size;
        let exprs = self
            .exprs
            .iter()
            .map(|e| match e {
                MappingExpr::Unknown | MappingExpr::None => {
                    next += 1;
                    MappingExpr::Dim(next - 1)
                }
                other => *other,
            })
            .collect();
        Self::from_parts(next, exprs)
    }

    /// Replace every `?` with `none`.
    pub fn make_fully_specified(&self) -> Mapping {
        let exprs = self
            .exprs
            .iter()
            .map(|e| match e {
                MappingExpr::Unknown => MappingExpr::None,
                other => *other,
            })
            .collect();
        Self::from_parts(self.use_domain_size, exprs)
    }

    fn checked(&self, exprs: Vec<MappingExpr>) -> Mapping {
        assert!(
            exprs
                .iter()
                .flat_map(|e| e.dims())
                .all(|d| d < self.use_domain_size),
            "expression out of the use domain of {}",
            self
        );
        Self::from_parts(self.use_domain_size, exprs)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = (0..self.use_domain_size).map(|d| format!("d{}", d)).collect();
        let exprs: Vec<String> = self.exprs.iter().map(|e| e.to_string()).collect();
        write!(f, "({}) -> ({})", dims.join(", "), exprs.join(", "))
    }
}
