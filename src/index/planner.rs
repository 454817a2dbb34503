//! Query planner
//!
//! Rules:
//! - Every query must be served by a declared index; there is no fallback
//!   scan.
//! - An index matches only when its fields are, in order: the tenant field,
//!   every equality field (any order, as one contiguous block), at most one
//!   range field, then the order-by clauses with exact directions. Trailing
//!   fields beyond that are allowed.
//! - Matching indexes are scored (equality 10, range 5, order-by 3); the
//!   highest score wins and ties go to the lexicographically smallest name.
//! - Rejections always carry a definition that would serve the query.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use super::btree::{IndexKey, KeyPart, KeyValue};
use super::definition::{Direction, IndexDefinition, IndexField};
use super::errors::{IndexError, IndexResult};
use super::query::{FilterOp, OrderBy, QuerySpec, WhereClause};

const EQUALITY_SCORE: u32 = 10;
const RANGE_SCORE: u32 = 5;
const ORDER_SCORE: u32 = 3;

/// A query reduced to the parts that constrain index choice.
#[derive(Debug)]
struct QueryShape<'a> {
    /// Distinct equality fields, in declaration order
    equality: Vec<&'a str>,
    range: Option<&'a WhereClause>,
    /// Range clauses beyond the first, which no index can serve
    extra_ranges: Vec<&'a WhereClause>,
    order_by: Vec<&'a OrderBy>,
    /// Range field is also the first order-by field
    range_is_ordered: bool,
    /// Every clause except the tenant clause, re-checked per entry
    residual: Vec<&'a WhereClause>,
}

impl<'a> QueryShape<'a> {
    fn analyze(spec: &'a QuerySpec, tenant_field: &str) -> IndexResult<Self> {
        if spec.collection.is_empty() || spec.collection.contains('/') {
            return Err(IndexError::InvalidQuery(format!(
                "'{}' is not a collection name",
                spec.collection
            )));
        }
        if spec.tenant.is_empty() {
            return Err(IndexError::InvalidQuery("query has no tenant".into()));
        }

        let mut equality: Vec<&str> = Vec::new();
        let mut ranges: Vec<&WhereClause> = Vec::new();
        let mut residual = Vec::new();

        for clause in &spec.filters {
            if clause.field == tenant_field {
                let same_tenant = clause.op.is_equality()
                    && clause.value == Value::String(spec.tenant.clone());
                if !same_tenant {
                    return Err(IndexError::InvalidQuery(format!(
                        "a where-clause on '{}' must be '== {}'",
                        tenant_field, spec.tenant
                    )));
                }
                continue;
            }

            residual.push(clause);
            if clause.op.is_equality() {
                if !equality.contains(&clause.field.as_str()) {
                    equality.push(&clause.field);
                }
            } else {
                ranges.push(clause);
            }
        }

        // A range on a field pinned by equality is checked per entry only.
        ranges.retain(|clause| !equality.contains(&clause.field.as_str()));
        let mut ranges = ranges.into_iter();
        let range = ranges.next();
        let extra_ranges: Vec<&WhereClause> = ranges.collect();

        let mut order_by: Vec<&OrderBy> = Vec::new();
        for clause in &spec.order_by {
            if clause.field == tenant_field || equality.contains(&clause.field.as_str()) {
                continue;
            }
            if order_by.iter().any(|o| o.field == clause.field) {
                return Err(IndexError::InvalidQuery(format!(
                    "'{}' appears twice in orderBy",
                    clause.field
                )));
            }
            order_by.push(clause);
        }

        let range_is_ordered = match (range, order_by.first()) {
            (Some(range), Some(first)) => range.field == first.field,
            _ => false,
        };
        if let Some(range) = range {
            if order_by.iter().skip(1).any(|o| o.field == range.field) {
                return Err(IndexError::InvalidQuery(format!(
                    "range field '{}' must be the first orderBy field",
                    range.field
                )));
            }
        }

        Ok(Self {
            equality,
            range,
            extra_ranges,
            order_by,
            range_is_ordered,
            residual,
        })
    }

    /// Score `definition` against this shape, or `None` if it cannot serve it.
    fn score(&self, definition: &IndexDefinition, tenant_field: &str) -> Option<u32> {
        let fields = &definition.fields;
        if fields.first()?.field != tenant_field {
            return None;
        }

        let block_end = 1 + self.equality.len();
        if fields.len() < block_end {
            return None;
        }
        let block: HashSet<&str> = fields[1..block_end].iter().map(|f| f.field.as_str()).collect();
        if !self.equality.iter().all(|field| block.contains(field)) {
            return None;
        }

        let mut score = EQUALITY_SCORE * self.equality.len() as u32;
        let mut position = block_end;
        let mut order = self.order_by.as_slice();

        if let Some(range) = self.range {
            let field = fields.get(position)?;
            if field.field != range.field {
                return None;
            }
            if self.range_is_ordered {
                if field.direction != order[0].direction {
                    return None;
                }
                score += ORDER_SCORE;
                order = &order[1..];
            }
            score += RANGE_SCORE;
            position += 1;
        }

        for clause in order {
            let field = fields.get(position)?;
            if field.field != clause.field || field.direction != clause.direction {
                return None;
            }
            score += ORDER_SCORE;
            position += 1;
        }

        Some(score)
    }

    /// The tightest definition that would serve this shape.
    fn suggest(&self, collection: &str, tenant_field: &str) -> IndexDefinition {
        let mut fields = vec![IndexField::new(tenant_field, Direction::Asc)];
        fields.extend(
            self.equality
                .iter()
                .map(|field| IndexField::new(*field, Direction::Asc)),
        );
        if let Some(range) = self.range {
            if !self.range_is_ordered {
                fields.push(IndexField::new(range.field.as_str(), Direction::Asc));
            }
        }
        fields.extend(
            self.order_by
                .iter()
                .map(|clause| IndexField::new(clause.field.as_str(), clause.direction)),
        );

        let mut name = collection.to_string();
        for field in &fields {
            name.push('_');
            name.push_str(&field.field);
            if field.direction == Direction::Desc {
                name.push_str("_desc");
            }
        }

        IndexDefinition {
            name,
            collection: collection.to_string(),
            fields,
        }
    }
}

/// Residual predicate bound to an index position.
#[derive(Debug, Clone, PartialEq)]
struct Residual {
    position: usize,
    op: FilterOp,
    value: KeyValue,
}

impl Residual {
    fn matches(&self, key: &IndexKey) -> bool {
        let Some(part) = key.parts().get(self.position) else {
            return false;
        };
        let actual = &part.value;
        match self.op {
            FilterOp::Eq => *actual == self.value,
            _ if !actual.same_kind(&self.value) => false,
            FilterOp::Lt => *actual < self.value,
            FilterOp::Lte => *actual <= self.value,
            FilterOp::Gt => *actual > self.value,
            FilterOp::Gte => *actual >= self.value,
        }
    }
}

/// Concrete key bounds for one planned query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScanBounds {
    pub prefix: Vec<KeyPart>,
    pub lower: Option<KeyPart>,
    pub upper: Option<KeyPart>,
    residual: Vec<Residual>,
    /// Some clause value can never appear in an index
    pub unsatisfiable: bool,
}

impl ScanBounds {
    fn build(
        spec: &QuerySpec,
        shape: &QueryShape<'_>,
        definition: &IndexDefinition,
    ) -> Self {
        let fields = &definition.fields;
        let mut unsatisfiable = false;

        let mut prefix = vec![KeyPart::new(
            KeyValue::String(spec.tenant.clone()),
            fields[0].direction,
        )];
        for field in &fields[1..1 + shape.equality.len()] {
            let clause = shape
                .residual
                .iter()
                .find(|c| c.op.is_equality() && c.field == field.field);
            match clause.and_then(|c| KeyValue::from_json(&c.value)) {
                Some(value) => prefix.push(KeyPart::new(value, field.direction)),
                None => unsatisfiable = true,
            }
        }

        let (mut lower, mut upper) = (None, None);
        if let Some(range) = shape.range {
            let direction = fields[1 + shape.equality.len()].direction;
            match KeyValue::from_json(&range.value) {
                Some(value) => {
                    let part = Some(KeyPart::new(value, direction));
                    match (range.op.is_lower_bound(), direction) {
                        (true, Direction::Asc) | (false, Direction::Desc) => lower = part,
                        (false, Direction::Asc) | (true, Direction::Desc) => upper = part,
                    }
                }
                None => unsatisfiable = true,
            }
        }

        let mut residual = Vec::new();
        for clause in &shape.residual {
            let position = fields.iter().position(|f| f.field == clause.field);
            match (position, KeyValue::from_json(&clause.value)) {
                (Some(position), Some(value)) => residual.push(Residual {
                    position,
                    op: clause.op,
                    value,
                }),
                _ => unsatisfiable = true,
            }
        }

        Self {
            prefix,
            lower,
            upper,
            residual,
            unsatisfiable,
        }
    }

    /// Re-check every where-clause against an entry's key.
    pub fn matches(&self, key: &IndexKey) -> bool {
        self.residual.iter().all(|r| r.matches(key))
    }
}

/// The chosen index and how the query will use it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub index_name: String,
    pub collection: String,
    pub tenant: String,
    pub score: u32,
    /// Equality fields in index order
    pub equality_fields: Vec<String>,
    pub range_field: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub(crate) bounds: ScanBounds,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "INDEX SCAN {} on {} (score {}) eq [{}]",
            self.index_name,
            self.collection,
            self.score,
            self.equality_fields.join(", ")
        )?;
        if let Some(range) = &self.range_field {
            write!(f, " range {}", range)?;
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.field, o.direction))
                .collect();
            write!(f, " order [{}]", order.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {}", limit)?;
        }
        Ok(())
    }
}

/// Choose an index for `spec` among `candidates`.
///
/// Candidates on other collections are ignored.
pub fn plan_query<'a>(
    spec: &QuerySpec,
    candidates: impl IntoIterator<Item = &'a IndexDefinition>,
    tenant_field: &str,
) -> IndexResult<QueryPlan> {
    let shape = QueryShape::analyze(spec, tenant_field)?;

    if !shape.extra_ranges.is_empty() {
        let mut fields: Vec<&str> = shape.range.map(|r| r.field.as_str()).into_iter().collect();
        fields.extend(shape.extra_ranges.iter().map(|r| r.field.as_str()));
        return Err(IndexError::QueryNotIndexed {
            collection: spec.collection.clone(),
            reason: format!(
                "at most one range condition is allowed, found {} ({})",
                fields.len(),
                fields.join(", ")
            ),
            suggested: shape.suggest(&spec.collection, tenant_field),
        });
    }

    let mut best: Option<(u32, &IndexDefinition)> = None;
    for definition in candidates {
        if definition.collection != spec.collection {
            continue;
        }
        let Some(score) = shape.score(definition, tenant_field) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_score, current)) => {
                score > best_score || (score == best_score && definition.name < current.name)
            }
        };
        if better {
            best = Some((score, definition));
        }
    }

    let Some((score, definition)) = best else {
        let suggested = shape.suggest(&spec.collection, tenant_field);
        let order: Vec<String> = suggested
            .fields
            .iter()
            .map(|f| format!("{} {}", f.field, f.direction))
            .collect();
        return Err(IndexError::QueryNotIndexed {
            collection: spec.collection.clone(),
            reason: format!("no index has the field order [{}]", order.join(", ")),
            suggested,
        });
    };

    let bounds = ScanBounds::build(spec, &shape, definition);
    let equality_fields = definition.fields[1..1 + shape.equality.len()]
        .iter()
        .map(|f| f.field.clone())
        .collect();

    Ok(QueryPlan {
        index_name: definition.name.clone(),
        collection: spec.collection.clone(),
        tenant: spec.tenant.clone(),
        score,
        equality_fields,
        range_field: shape.range.map(|r| r.field.clone()),
        order_by: shape.order_by.iter().map(|o| (*o).clone()).collect(),
        limit: spec.limit,
        bounds,
    })
}
