//! Structural validation of generated SQL against the schema catalog.
//!
//! Runs after the lexical read-only gate. Violations found here are
//! repairable; anything that is not a single read-only query is not.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{
    BinaryOperator, Expr, Ident, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use super::guard::check_read_only;
use crate::catalog::SchemaCatalog;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SqlViolation {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("table `{0}` does not exist")]
    UnknownTable(String),
    #[error("column `{column}` does not exist on `{qualifier}`")]
    UnknownColumn { qualifier: String, column: String },
    #[error("column `{0}` does not belong to any table in the query")]
    UnresolvedColumn(String),
    #[error("alias `{0}` is not defined in the query")]
    UnknownAlias(String),
    #[error("join between `{left}` and `{right}` does not follow a known relationship")]
    UnknownJoin { left: String, right: String },
    #[error("join on `{0}` has no ON condition")]
    UnconstrainedJoin(String),
    #[error("output expression `{0}` needs an alias")]
    MissingProjectionAlias(String),
    #[error("SELECT * is not allowed in the final projection")]
    WildcardProjection,
    #[error("query projects no columns")]
    EmptyProjection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Not a single read-only query. Never repaired.
    Unsafe(String),
    /// Fixable problems, described for a repair attempt.
    Invalid(Vec<SqlViolation>),
}

impl ValidationFailure {
    pub fn describe(&self) -> String {
        match self {
            Self::Unsafe(reason) => reason.clone(),
            Self::Invalid(violations) => violations
                .iter()
                .map(|violation| format!("- {violation}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsafe(reason) => write!(f, "unsafe statement: {reason}"),
            Self::Invalid(violations) => {
                write!(f, "{} schema violation(s): {}", violations.len(), self.describe())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSql {
    /// Output column names of the outermost SELECT, in order.
    pub projection: Vec<String>,
    /// Physical catalog tables the statement reads.
    pub tables: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct OutputColumn {
    name: String,
    /// Physical `(table, column)` when the output is a plain column reference.
    source: Option<(String, String)>,
}

#[derive(Clone, Debug)]
enum Binding {
    Table(String),
    Derived(Vec<OutputColumn>),
    /// Unknown table, or a recursive CTE referenced from its own body.
    Opaque,
}

impl Binding {
    fn has_column(&self, catalog: &SchemaCatalog, column: &str) -> bool {
        match self {
            Self::Table(table) => catalog.column(table, column).is_some(),
            Self::Derived(columns) => {
                columns.iter().any(|output| output.name.eq_ignore_ascii_case(column))
            }
            Self::Opaque => true,
        }
    }

    fn source(&self, catalog: &SchemaCatalog, column: &str) -> Option<(String, String)> {
        match self {
            Self::Table(table) => {
                catalog.column(table, column).map(|entity| (table.clone(), entity.physical.clone()))
            }
            Self::Derived(columns) => columns
                .iter()
                .find(|output| output.name.eq_ignore_ascii_case(column))
                .and_then(|output| output.source.clone()),
            Self::Opaque => None,
        }
    }

    fn columns(&self, catalog: &SchemaCatalog) -> Vec<OutputColumn> {
        match self {
            Self::Table(table) => catalog
                .columns_of(table)
                .into_iter()
                .map(|entity| OutputColumn {
                    name: entity.physical.to_ascii_lowercase(),
                    source: Some((table.clone(), entity.physical.clone())),
                })
                .collect(),
            Self::Derived(columns) => columns.clone(),
            Self::Opaque => Vec::new(),
        }
    }
}

/// Names visible inside one SELECT. Correlated subqueries see the
/// enclosing SELECT through `outer`.
struct Scope<'s> {
    outer: Option<&'s Scope<'s>>,
    bindings: BTreeMap<String, Binding>,
    aliases: BTreeSet<String>,
}

impl<'s> Scope<'s> {
    fn new(outer: Option<&'s Scope<'s>>) -> Self {
        Self { outer, bindings: BTreeMap::new(), aliases: BTreeSet::new() }
    }

    fn binding(&self, qualifier: &str) -> Option<&Binding> {
        self.bindings
            .get(&qualifier.to_ascii_lowercase())
            .or_else(|| self.outer.and_then(|outer| outer.binding(qualifier)))
    }

    fn knows_column(&self, catalog: &SchemaCatalog, column: &str) -> bool {
        self.aliases.contains(&column.to_ascii_lowercase())
            || self.bindings.values().any(|binding| binding.has_column(catalog, column))
            || self.outer.is_some_and(|outer| outer.knows_column(catalog, column))
    }

    fn source_of(&self, catalog: &SchemaCatalog, expr: &Expr) -> Option<(String, String)> {
        match expr {
            Expr::Identifier(ident) => self
                .bindings
                .values()
                .filter(|binding| !matches!(binding, Binding::Opaque))
                .find(|binding| binding.has_column(catalog, &ident.value))
                .and_then(|binding| binding.source(catalog, &ident.value)),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [.., qualifier, column] => {
                    self.binding(&qualifier.value)?.source(catalog, &column.value)
                }
                _ => None,
            },
            Expr::Nested(inner) => self.source_of(catalog, inner),
            _ => None,
        }
    }
}

type Ctes = BTreeMap<String, Binding>;

/// Identifiers and nested queries of an expression tree, without
/// descending into the nested queries themselves.
#[derive(Default)]
struct ExprRefs {
    depth: usize,
    identifiers: Vec<Vec<String>>,
    subqueries: Vec<Query>,
}

impl ExprRefs {
    fn scan<V: Visit>(&mut self, node: &V) {
        let _ = node.visit(self);
    }
}

impl Visitor for ExprRefs {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            self.subqueries.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Identifier(ident) => self.identifiers.push(vec![ident.value.clone()]),
            Expr::CompoundIdentifier(parts) => {
                self.identifiers.push(parts.iter().map(|ident| ident.value.clone()).collect())
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

struct QueryChecker<'a> {
    catalog: &'a SchemaCatalog,
    violations: Vec<SqlViolation>,
    tables: BTreeSet<String>,
}

pub struct SqlValidator<'a> {
    catalog: &'a SchemaCatalog,
}

impl<'a> SqlValidator<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    pub fn validate(&self, sql: &str) -> Result<ValidatedSql, ValidationFailure> {
        check_read_only(sql).map_err(|error| ValidationFailure::Unsafe(error.to_string()))?;

        let statements = Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|error| {
            ValidationFailure::Invalid(vec![SqlViolation::Syntax(error.to_string())])
        })?;
        let [Statement::Query(query)] = statements.as_slice() else {
            return Err(ValidationFailure::Unsafe(format!(
                "expected exactly one query, found {} statement(s)",
                statements.len()
            )));
        };

        let mut checker = QueryChecker::new(self.catalog);
        checker.check_query(query, None, &Ctes::new()).map_err(ValidationFailure::Unsafe)?;
        let mut violations = checker.violations;

        let projection = match top_level_projection(query) {
            Ok(projection) => projection,
            Err(projection_violations) => {
                violations.extend(projection_violations);
                Vec::new()
            }
        };

        let mut seen = BTreeSet::new();
        violations.retain(|violation| seen.insert(violation.to_string()));
        if !violations.is_empty() {
            return Err(ValidationFailure::Invalid(violations));
        }
        Ok(ValidatedSql { projection, tables: checker.tables })
    }
}

impl<'a> QueryChecker<'a> {
    fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog, violations: Vec::new(), tables: BTreeSet::new() }
    }

    /// Checks one query and returns its output columns. `Err` means the
    /// query is not a plain read and must not be repaired.
    fn check_query(
        &mut self,
        query: &Query,
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
    ) -> Result<Vec<OutputColumn>, String> {
        let mut ctes = ctes.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_ascii_lowercase();
                if with.recursive {
                    ctes.insert(name.clone(), Binding::Opaque);
                }
                let columns = self.check_query(&cte.query, outer, &ctes)?;
                ctes.insert(name, Binding::Derived(renamed(columns, &cte.alias.columns)));
            }
        }

        let trailing: Vec<&Expr> =
            query.order_by.iter().map(|item| &item.expr).chain(query.limit.as_ref()).collect();
        self.check_set_expr(&query.body, outer, &ctes, &trailing)
    }

    fn check_set_expr(
        &mut self,
        body: &SetExpr,
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
        trailing: &[&Expr],
    ) -> Result<Vec<OutputColumn>, String> {
        match body {
            SetExpr::Select(select) => self.check_select(select, outer, ctes, trailing),
            SetExpr::Query(query) => {
                let columns = self.check_query(query, outer, ctes)?;
                self.check_output_refs(&columns, outer, ctes, trailing)?;
                Ok(columns)
            }
            SetExpr::SetOperation { left, right, .. } => {
                let columns = self.check_set_expr(left, outer, ctes, &[])?;
                self.check_set_expr(right, outer, ctes, &[])?;
                self.check_output_refs(&columns, outer, ctes, trailing)?;
                Ok(columns)
            }
            SetExpr::Values(_) => Ok(Vec::new()),
            other => Err(format!("unsupported query body `{other}`")),
        }
    }

    /// ORDER BY and LIMIT over a compound query see only its output names.
    fn check_output_refs(
        &mut self,
        columns: &[OutputColumn],
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
        trailing: &[&Expr],
    ) -> Result<(), String> {
        if trailing.is_empty() {
            return Ok(());
        }
        let mut scope = Scope::new(outer);
        scope.aliases = columns.iter().map(|column| column.name.clone()).collect();
        let mut refs = ExprRefs::default();
        for expr in trailing {
            refs.scan(*expr);
        }
        self.check_refs(&scope, ctes, refs)
    }

    fn check_select(
        &mut self,
        select: &Select,
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
        trailing: &[&Expr],
    ) -> Result<Vec<OutputColumn>, String> {
        if select.into.is_some() {
            return Err("SELECT INTO writes a table".to_owned());
        }

        let mut scope = Scope::new(outer);
        let mut join_conditions = Vec::new();
        for (index, table) in select.from.iter().enumerate() {
            if index > 0 {
                self.violations.push(SqlViolation::UnconstrainedJoin(table.relation.to_string()));
            }
            self.bind_table_with_joins(table, &mut scope, outer, ctes, &mut join_conditions)?;
        }

        let columns = self.output_columns(select, &scope);
        let mut projection_refs = ExprRefs::default();
        projection_refs.scan(&select.projection);
        self.check_refs(&scope, ctes, projection_refs)?;

        // Output aliases are visible to the clauses after the select list.
        scope.aliases = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_ascii_lowercase()),
                _ => None,
            })
            .collect();

        let mut refs = ExprRefs::default();
        refs.scan(&select.selection);
        refs.scan(&select.group_by);
        refs.scan(&select.having);
        refs.scan(&select.qualify);
        for (condition, _) in &join_conditions {
            refs.scan(*condition);
        }
        for expr in trailing {
            refs.scan(*expr);
        }
        self.check_refs(&scope, ctes, refs)?;

        for (condition, relation) in &join_conditions {
            self.check_join(&scope, condition, relation);
        }
        Ok(columns)
    }

    fn check_refs(&mut self, scope: &Scope<'_>, ctes: &Ctes, refs: ExprRefs) -> Result<(), String> {
        for parts in &refs.identifiers {
            match parts.as_slice() {
                [column] => {
                    if !scope.knows_column(self.catalog, column) {
                        self.violations.push(SqlViolation::UnresolvedColumn(column.clone()));
                    }
                }
                [.., qualifier, column] => match scope.binding(qualifier) {
                    Some(binding) => {
                        if !binding.has_column(self.catalog, column) {
                            self.violations.push(SqlViolation::UnknownColumn {
                                qualifier: qualifier.clone(),
                                column: column.clone(),
                            });
                        }
                    }
                    None => self.violations.push(SqlViolation::UnknownAlias(qualifier.clone())),
                },
                [] => {}
            }
        }
        for subquery in &refs.subqueries {
            self.check_query(subquery, Some(scope), ctes)?;
        }
        Ok(())
    }

    fn bind_table_with_joins<'q>(
        &mut self,
        table: &'q TableWithJoins,
        scope: &mut Scope<'_>,
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
        conditions: &mut Vec<(&'q Expr, String)>,
    ) -> Result<(), String> {
        self.bind_factor(&table.relation, scope, outer, ctes, conditions)?;
        for join in &table.joins {
            self.bind_factor(&join.relation, scope, outer, ctes, conditions)?;
            let constraint = match &join.join_operator {
                JoinOperator::Inner(constraint)
                | JoinOperator::LeftOuter(constraint)
                | JoinOperator::RightOuter(constraint)
                | JoinOperator::FullOuter(constraint) => Some(constraint),
                _ => None,
            };
            match constraint {
                Some(JoinConstraint::On(condition)) => {
                    conditions.push((condition, join.relation.to_string()));
                }
                _ => {
                    self.violations.push(SqlViolation::UnconstrainedJoin(join.relation.to_string()))
                }
            }
        }
        Ok(())
    }

    fn bind_factor<'q>(
        &mut self,
        factor: &'q TableFactor,
        scope: &mut Scope<'_>,
        outer: Option<&Scope<'_>>,
        ctes: &Ctes,
        conditions: &mut Vec<(&'q Expr, String)>,
    ) -> Result<(), String> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let Some(table_name) = name.0.last().map(|ident| ident.value.clone()) else {
                    return Ok(());
                };
                let key = table_name.to_ascii_lowercase();
                let binding = if let Some(cte) = ctes.get(&key) {
                    cte.clone()
                } else if let Some(entity) = self.catalog.table(&table_name) {
                    self.tables.insert(entity.physical.clone());
                    Binding::Table(entity.physical.clone())
                } else {
                    self.violations.push(SqlViolation::UnknownTable(table_name));
                    Binding::Opaque
                };
                if let Some(alias) = alias {
                    scope.bindings.insert(alias.name.value.to_ascii_lowercase(), binding.clone());
                }
                scope.bindings.insert(key, binding);
            }
            TableFactor::Derived { subquery, alias, .. } => {
                let columns = self.check_query(subquery, outer, ctes)?;
                match alias {
                    Some(alias) => {
                        scope.bindings.insert(
                            alias.name.value.to_ascii_lowercase(),
                            Binding::Derived(renamed(columns, &alias.columns)),
                        );
                    }
                    None => {
                        let key = format!("#derived{}", scope.bindings.len());
                        scope.bindings.insert(key, Binding::Derived(columns));
                    }
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.bind_table_with_joins(table_with_joins, scope, outer, ctes, conditions)?;
            }
            other => self.violations.push(SqlViolation::UnknownTable(other.to_string())),
        }
        Ok(())
    }

    fn output_columns(&self, select: &Select, scope: &Scope<'_>) -> Vec<OutputColumn> {
        let mut columns: Vec<OutputColumn> = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::ExprWithAlias { expr, alias } => columns.push(OutputColumn {
                    name: alias.value.to_ascii_lowercase(),
                    source: scope.source_of(self.catalog, expr),
                }),
                SelectItem::UnnamedExpr(expr) => {
                    let name = match expr {
                        Expr::Identifier(ident) => ident.value.clone(),
                        Expr::CompoundIdentifier(parts) => {
                            parts.last().map(|ident| ident.value.clone()).unwrap_or_default()
                        }
                        other => other.to_string(),
                    };
                    columns.push(OutputColumn {
                        name: name.to_ascii_lowercase(),
                        source: scope.source_of(self.catalog, expr),
                    });
                }
                SelectItem::Wildcard(_) => {
                    for binding in scope.bindings.values() {
                        for column in binding.columns(self.catalog) {
                            if !columns.iter().any(|existing| existing.name == column.name) {
                                columns.push(column);
                            }
                        }
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let binding = name.0.last().and_then(|ident| scope.binding(&ident.value));
                    if let Some(binding) = binding {
                        columns.extend(binding.columns(self.catalog));
                    }
                }
            }
        }
        columns
    }

    /// A join condition must be an AND-chain of qualified column
    /// equalities, each following a catalog relationship.
    fn check_join(&mut self, scope: &Scope<'_>, condition: &Expr, relation: &str) {
        let mut conjuncts = Vec::new();
        flatten_and(condition, &mut conjuncts);
        for conjunct in conjuncts {
            let (left, right) = match conjunct {
                Expr::BinaryOp { left, op: BinaryOperator::Eq, right } => {
                    (left.as_ref(), right.as_ref())
                }
                Expr::BinaryOp { left, right, .. } => {
                    self.violations.push(SqlViolation::UnknownJoin {
                        left: left.to_string(),
                        right: right.to_string(),
                    });
                    continue;
                }
                other => {
                    self.violations.push(SqlViolation::UnknownJoin {
                        left: other.to_string(),
                        right: relation.to_owned(),
                    });
                    continue;
                }
            };

            let (Some((left_qualifier, left_column)), Some((right_qualifier, right_column))) =
                (qualified(left), qualified(right))
            else {
                self.violations.push(SqlViolation::UnknownJoin {
                    left: left.to_string(),
                    right: right.to_string(),
                });
                continue;
            };
            let (Some(left_binding), Some(right_binding)) =
                (scope.binding(left_qualifier), scope.binding(right_qualifier))
            else {
                continue;
            };
            if matches!(left_binding, Binding::Opaque) || matches!(right_binding, Binding::Opaque) {
                continue;
            }
            if !left_binding.has_column(self.catalog, left_column)
                || !right_binding.has_column(self.catalog, right_column)
            {
                continue;
            }

            match (
                left_binding.source(self.catalog, left_column),
                right_binding.source(self.catalog, right_column),
            ) {
                (Some(left), Some(right))
                    if self
                        .catalog
                        .relationship((&left.0, &left.1), (&right.0, &right.1))
                        .is_some() => {}
                (Some(left), Some(right)) => self.violations.push(SqlViolation::UnknownJoin {
                    left: format!("{}.{}", left.0, left.1),
                    right: format!("{}.{}", right.0, right.1),
                }),
                _ => self.violations.push(SqlViolation::UnknownJoin {
                    left: left.to_string(),
                    right: right.to_string(),
                }),
            }
        }
    }
}

fn renamed(columns: Vec<OutputColumn>, aliases: &[Ident]) -> Vec<OutputColumn> {
    if aliases.is_empty() {
        return columns;
    }
    aliases
        .iter()
        .enumerate()
        .map(|(index, alias)| OutputColumn {
            name: alias.value.to_ascii_lowercase(),
            source: columns.get(index).and_then(|column| column.source.clone()),
        })
        .collect()
}

fn flatten_and<'e>(expr: &'e Expr, conjuncts: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            flatten_and(left, conjuncts);
            flatten_and(right, conjuncts);
        }
        Expr::Nested(inner) => flatten_and(inner, conjuncts),
        other => conjuncts.push(other),
    }
}

/// `(qualifier, column)` of an `alias.column` reference.
fn qualified(expr: &Expr) -> Option<(&str, &str)> {
    match expr {
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [.., qualifier, column] => Some((qualifier.value.as_str(), column.value.as_str())),
            _ => None,
        },
        Expr::Nested(inner) => qualified(inner),
        _ => None,
    }
}

fn top_level_projection(query: &Query) -> Result<Vec<String>, Vec<SqlViolation>> {
    let mut body = query.body.as_ref();
    let select = loop {
        match body {
            SetExpr::Select(select) => break select,
            SetExpr::SetOperation { left, .. } => body = left.as_ref(),
            SetExpr::Query(inner) => body = inner.body.as_ref(),
            _ => return Err(vec![SqlViolation::EmptyProjection]),
        }
    };

    let mut names = Vec::with_capacity(select.projection.len());
    let mut violations = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::ExprWithAlias { alias, .. } => names.push(alias.value.clone()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => names.push(ident.value.clone()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                names.extend(parts.last().map(|ident| ident.value.clone()));
            }
            SelectItem::UnnamedExpr(expr) => {
                violations.push(SqlViolation::MissingProjectionAlias(expr.to_string()));
            }
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                violations.push(SqlViolation::WildcardProjection);
            }
        }
    }
    if names.is_empty() && violations.is_empty() {
        violations.push(SqlViolation::EmptyProjection);
    }
    if violations.is_empty() {
        Ok(names)
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::{SqlValidator, SqlViolation, ValidationFailure};
    use crate::test_support::crm_catalog;

    #[test]
    fn accepts_catalog_grounded_join() {
        let catalog = crm_catalog();
        let validated = SqlValidator::new(&catalog)
            .validate(
                "SELECT a.BillingCountry AS country, SUM(o.Amount) AS revenue \
                 FROM Opportunity o JOIN Account a ON o.AccountId = a.Id \
                 WHERE o.CloseDate >= '2024-01-01' AND o.CloseDate < '2025-01-01' \
                 GROUP BY a.BillingCountry ORDER BY revenue DESC LIMIT 5",
            )
            .expect("valid");
        assert_eq!(validated.projection, vec!["country", "revenue"]);
        assert!(validated.tables.contains("Opportunity"));
        assert!(validated.tables.contains("Account"));
    }

    #[test]
    fn accepts_ranked_subquery_and_ctes() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        let ranked = "SELECT country, customer, revenue FROM (\
             SELECT a.BillingCountry AS country, a.Name AS customer, SUM(o.Amount) AS revenue, \
             ROW_NUMBER() OVER (PARTITION BY a.BillingCountry ORDER BY SUM(o.Amount) DESC) AS group_rank \
             FROM Opportunity o JOIN Account a ON o.AccountId = a.Id \
             GROUP BY a.BillingCountry, a.Name) ranked \
             WHERE group_rank <= 5 ORDER BY country ASC, revenue DESC";
        assert_eq!(
            validator.validate(ranked).expect("ranked").projection,
            vec!["country", "customer", "revenue"]
        );

        let cte = "WITH won AS (SELECT AccountId, Amount FROM Opportunity WHERE StageName = 'Closed Won') \
                   SELECT won.AccountId AS account_id, SUM(won.Amount) AS revenue FROM won GROUP BY won.AccountId";
        assert_eq!(validator.validate(cte).expect("cte").projection, vec!["account_id", "revenue"]);
    }

    #[test]
    fn reports_unknown_tables_columns_and_aliases() {
        let catalog = crm_catalog();
        let failure = SqlValidator::new(&catalog)
            .validate("SELECT o.Discount AS discount, x.Name AS name FROM Opportunity o JOIN Invoice i ON o.Id = i.OpportunityId")
            .expect_err("invalid");
        let ValidationFailure::Invalid(violations) = failure else {
            panic!("expected repairable violations");
        };
        assert!(violations.contains(&SqlViolation::UnknownTable("Invoice".to_owned())));
        assert!(violations.contains(&SqlViolation::UnknownColumn {
            qualifier: "o".to_owned(),
            column: "Discount".to_owned(),
        }));
        assert!(violations.contains(&SqlViolation::UnknownAlias("x".to_owned())));
    }

    #[test]
    fn rejects_joins_without_a_relationship() {
        let catalog = crm_catalog();
        let failure = SqlValidator::new(&catalog)
            .validate("SELECT l.Country AS country, COUNT(a.Id) AS accounts FROM Lead l JOIN Account a ON l.Country = a.BillingCountry GROUP BY l.Country")
            .expect_err("unknown join");
        assert_eq!(
            failure,
            ValidationFailure::Invalid(vec![SqlViolation::UnknownJoin {
                left: "Lead.Country".to_owned(),
                right: "Account.BillingCountry".to_owned(),
            }])
        );
    }

    #[test]
    fn projection_needs_names() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        assert_eq!(
            validator.validate("SELECT SUM(Amount) FROM Opportunity"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::MissingProjectionAlias(
                "SUM(Amount)".to_owned()
            )]))
        );
        assert_eq!(
            validator.validate("SELECT * FROM Opportunity"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::WildcardProjection]))
        );
    }

    #[test]
    fn syntax_errors_are_repairable_but_mutations_are_not() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        assert!(matches!(
            validator.validate("SELECT Name AS name FROM Account WHERE"),
            Err(ValidationFailure::Invalid(violations)) if matches!(violations[0], SqlViolation::Syntax(_))
        ));
        assert!(matches!(
            validator.validate("SELECT Name AS name FROM Account; DELETE FROM Account"),
            Err(ValidationFailure::Unsafe(_))
        ));
    }

    #[test]
    fn unqualified_columns_resolve_against_bound_tables() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        assert!(validator.validate("SELECT StageName AS stage, COUNT(Id) AS deals FROM Opportunity GROUP BY StageName").is_ok());
        assert_eq!(
            validator.validate("SELECT Region AS sales_region FROM Opportunity"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::UnresolvedColumn("Region".to_owned())]))
        );
    }

    #[test]
    fn missing_columns_inside_subqueries_and_ctes_are_reported() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        assert_eq!(
            validator.validate("SELECT x FROM (SELECT Discount AS x FROM Opportunity) t"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::UnresolvedColumn("Discount".to_owned())]))
        );
        assert_eq!(
            validator.validate("WITH w AS (SELECT Bogus AS b FROM Opportunity) SELECT w.b AS b FROM w"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::UnresolvedColumn("Bogus".to_owned())]))
        );
        assert_eq!(
            validator.validate("SELECT t.y AS y FROM (SELECT Amount AS x FROM Opportunity) t"),
            Err(ValidationFailure::Invalid(vec![SqlViolation::UnknownColumn {
                qualifier: "t".to_owned(),
                column: "y".to_owned(),
            }]))
        );
    }

    #[test]
    fn columns_of_one_select_do_not_leak_into_another() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        let failure = validator
            .validate(
                "SELECT Region AS region FROM Opportunity \
                 WHERE OwnerId IN (SELECT Id FROM SalesRep WHERE Region = 'EMEA')",
            )
            .expect_err("Region is not an Opportunity column");
        assert_eq!(
            failure,
            ValidationFailure::Invalid(vec![SqlViolation::UnresolvedColumn("Region".to_owned())])
        );

        let correlated = "SELECT a.Name AS name FROM Account a WHERE EXISTS \
                          (SELECT o.Id FROM Opportunity o WHERE o.AccountId = a.Id AND Amount > 100)";
        assert!(validator.validate(correlated).is_ok());
    }

    #[test]
    fn join_conditions_must_be_related_column_equalities() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        let cases = [
            (
                "SELECT o.Name AS name FROM Opportunity o JOIN Account a ON 1 = 1",
                SqlViolation::UnknownJoin { left: "1".to_owned(), right: "1".to_owned() },
            ),
            (
                "SELECT o.Name AS name FROM Opportunity o JOIN Account a ON o.Amount > a.CreatedDate",
                SqlViolation::UnknownJoin {
                    left: "o.Amount".to_owned(),
                    right: "a.CreatedDate".to_owned(),
                },
            ),
            (
                "SELECT Country AS country, COUNT(Id) AS n FROM Lead l JOIN Account a ON Country = BillingCountry GROUP BY Country",
                SqlViolation::UnknownJoin {
                    left: "Country".to_owned(),
                    right: "BillingCountry".to_owned(),
                },
            ),
            (
                "SELECT o.Name AS name FROM Opportunity o JOIN Account a ON o.AccountId = a.Id OR 1 = 1",
                SqlViolation::UnknownJoin {
                    left: "o.AccountId = a.Id".to_owned(),
                    right: "1 = 1".to_owned(),
                },
            ),
        ];
        for (sql, expected) in cases {
            match validator.validate(sql) {
                Err(ValidationFailure::Invalid(violations)) => {
                    assert!(violations.contains(&expected), "{sql}: {violations:?}");
                }
                other => panic!("{sql}: expected a join violation, got {other:?}"),
            }
        }
    }

    #[test]
    fn joins_through_derived_tables_follow_column_provenance() {
        let catalog = crm_catalog();
        let validator = SqlValidator::new(&catalog);
        let related = "WITH won AS (SELECT AccountId, Amount FROM Opportunity) \
                       SELECT a.Name AS name, SUM(won.Amount) AS revenue \
                       FROM won JOIN Account a ON won.AccountId = a.Id GROUP BY a.Name";
        assert!(validator.validate(related).is_ok());

        let unrelated = "WITH won AS (SELECT OwnerId, Amount FROM Opportunity) \
                         SELECT a.Name AS name FROM won JOIN Account a ON won.OwnerId = a.Id";
        assert_eq!(
            validator.validate(unrelated),
            Err(ValidationFailure::Invalid(vec![SqlViolation::UnknownJoin {
                left: "Opportunity.OwnerId".to_owned(),
                right: "Account.Id".to_owned(),
            }]))
        );
    }
}
