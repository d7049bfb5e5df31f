//! Statement Classifier
//!
//! Parses raw SQL into a sqlparser tree and extracts the routing features:
//! write, join, aggregate, group-by, key-column equality and the tables a
//! statement touches. Classification is a pure function of the text and
//! the key-column configuration.

use crate::error::ParseError;
use itertools::Itertools;
use serde::Serialize;
use sqlparser::ast::{
    self, visit_relations, BinaryOperator, Expr, GroupByExpr, ObjectName, ObjectType, Query,
    Select, SetExpr, TableFactor, TableWithJoins, UnaryOperator, Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

pub const DEFAULT_MAX_SQL_BYTES: usize = 256 * 1024;
pub const DEFAULT_KEY_COLUMN: &str = "id";

const AGGREGATE_FUNCTIONS: [&str; 5] = ["count", "sum", "avg", "min", "max"];

/// Raw SQL text plus its parsed tree. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    tree: ast::Statement,
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn tree(&self) -> &ast::Statement {
        &self.tree
    }

    /// Read statements are the only ones whose table references get
    /// rewritten to storage locations.
    pub fn is_query(&self) -> bool {
        match &self.tree {
            ast::Statement::Query(query) => dml_body(&query.body).is_none(),
            _ => false,
        }
    }

    /// Every table a `DROP TABLE` names. Empty for any other statement.
    pub fn dropped_tables(&self) -> Vec<String> {
        match &self.tree {
            ast::Statement::Drop {
                object_type: ObjectType::Table,
                names,
                ..
            } => names.iter().map(object_name).collect(),
            _ => Vec::new(),
        }
    }

    /// Table a write statement modifies, if it names one.
    pub fn write_target(&self) -> Option<String> {
        explicit_write_target(&self.tree)
            .or_else(|| referenced_tables(&self.tree).into_iter().next())
    }
}

fn explicit_write_target(tree: &ast::Statement) -> Option<String> {
    match tree {
        ast::Statement::Insert { table_name, .. } => Some(object_name(table_name)),
        ast::Statement::CreateTable { name, .. } => Some(object_name(name)),
        ast::Statement::Drop { names, .. } => names.first().map(object_name),
        ast::Statement::Update { table, .. } => match &table.relation {
            TableFactor::Table { name, .. } => Some(object_name(name)),
            _ => None,
        },
        ast::Statement::Query(query) => dml_body(&query.body).and_then(explicit_write_target),
        _ => None,
    }
}

/// Routing-relevant features of one statement. Recomputed per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    pub has_join: bool,
    pub has_aggregate: bool,
    pub has_group_by: bool,
    pub is_write: bool,
    pub has_key_equality: bool,
    pub referenced_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    max_sql_bytes: usize,
    default_key_column: String,
    /// lowercase table name -> lowercase key column
    key_columns: HashMap<String, String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SQL_BYTES)
    }
}

impl Classifier {
    pub fn new(max_sql_bytes: usize) -> Self {
        Self {
            max_sql_bytes,
            default_key_column: DEFAULT_KEY_COLUMN.to_string(),
            key_columns: HashMap::new(),
        }
    }

    pub fn with_default_key_column(mut self, column: &str) -> Self {
        self.default_key_column = column.to_ascii_lowercase();
        self
    }

    pub fn with_key_column(mut self, table: &str, column: &str) -> Self {
        self.key_columns
            .insert(base_table_name(table), column.to_ascii_lowercase());
        self
    }

    pub fn max_sql_bytes(&self) -> usize {
        self.max_sql_bytes
    }

    /// Key column for a table, falling back to the default.
    pub fn key_column(&self, table: &str) -> &str {
        self.key_columns
            .get(&base_table_name(table))
            .map(String::as_str)
            .unwrap_or(&self.default_key_column)
    }

    pub fn parse(&self, sql: &str) -> Result<Statement, ParseError> {
        if sql.len() > self.max_sql_bytes {
            return Err(ParseError::TooLarge {
                size: sql.len(),
                limit: self.max_sql_bytes,
            });
        }
        if sql.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
            .map_err(|e| ParseError::Syntax(e.to_string()))?;

        match statements.len() {
            0 => Err(ParseError::Empty),
            1 => Ok(Statement {
                sql: sql.to_string(),
                tree: statements.remove(0),
            }),
            n => Err(ParseError::MultipleStatements(n)),
        }
    }

    pub fn classify(&self, sql: &str) -> Result<FeatureSet, ParseError> {
        let statement = self.parse(sql)?;
        Ok(self.features(&statement))
    }

    /// Extract features from an already parsed statement.
    pub fn features(&self, statement: &Statement) -> FeatureSet {
        let tree = &statement.tree;
        let mut features = FeatureSet {
            is_write: is_write(tree),
            has_join: has_join(tree),
            referenced_tables: referenced_tables(tree),
            ..FeatureSet::default()
        };

        if let ast::Statement::Query(query) = tree {
            let mut selects = Vec::new();
            top_level_selects(&query.body, &mut selects);

            features.has_aggregate = selects.iter().any(|s| projection_has_aggregate(s));
            features.has_group_by = selects.iter().any(|s| has_group_by(s));
            if let [select] = selects.as_slice() {
                features.has_key_equality = self.has_key_equality(select);
            }
        }

        features
    }

    fn has_key_equality(&self, select: &Select) -> bool {
        let Some(selection) = &select.selection else {
            return false;
        };
        let scope = TableScope::from_select(select);
        let mut predicates = Vec::new();
        conjuncts(selection, &mut predicates);

        predicates
            .into_iter()
            .any(|predicate| self.is_key_equality(predicate, &scope))
    }

    fn is_key_equality(&self, predicate: &Expr, scope: &TableScope) -> bool {
        let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = predicate
        else {
            return false;
        };
        let Some((qualifier, column)) = column_ref(left) else {
            return false;
        };
        is_literal(right) && self.is_key_column(qualifier.as_deref(), &column, scope)
    }

    fn is_key_column(&self, qualifier: Option<&str>, column: &str, scope: &TableScope) -> bool {
        let column = column.to_ascii_lowercase();
        match qualifier {
            Some(qualifier) => {
                let table = scope
                    .resolve(qualifier)
                    .unwrap_or_else(|| qualifier.to_ascii_lowercase());
                self.key_column(&table) == column
            }
            None if scope.tables.is_empty() => self.default_key_column == column,
            None => scope.tables.iter().any(|t| self.key_column(t) == column),
        }
    }
}

/// Dot-joined identifier values, quotes dropped.
pub fn object_name(name: &ObjectName) -> String {
    name.0.iter().map(|ident| &ident.value).join(".")
}

/// Last segment of a possibly qualified name, lowercased. This is the key
/// used for key-column lookups and the local fallback copies.
pub fn base_table_name(table: &str) -> String {
    table
        .rsplit('.')
        .next()
        .unwrap_or(table)
        .trim_matches(|c| c == '"' || c == '`')
        .to_ascii_lowercase()
}

fn is_write(tree: &ast::Statement) -> bool {
    match tree {
        ast::Statement::Query(query) => dml_body(&query.body).is_some(),
        ast::Statement::Insert { .. }
        | ast::Statement::Directory { .. }
        | ast::Statement::Update { .. }
        | ast::Statement::Delete { .. }
        | ast::Statement::Merge { .. }
        | ast::Statement::Truncate { .. } => true,
        ast::Statement::CreateTable { .. }
        | ast::Statement::CreateVirtualTable { .. }
        | ast::Statement::CreateView { .. }
        | ast::Statement::CreateIndex { .. }
        | ast::Statement::CreateRole { .. }
        | ast::Statement::CreateSchema { .. }
        | ast::Statement::CreateDatabase { .. }
        | ast::Statement::CreateFunction { .. }
        | ast::Statement::CreateProcedure { .. }
        | ast::Statement::CreateMacro { .. }
        | ast::Statement::CreateStage { .. }
        | ast::Statement::CreateSequence { .. }
        | ast::Statement::CreateType { .. } => true,
        ast::Statement::AlterTable { .. }
        | ast::Statement::AlterIndex { .. }
        | ast::Statement::AlterView { .. }
        | ast::Statement::AlterRole { .. } => true,
        ast::Statement::Drop { .. } | ast::Statement::DropFunction { .. } => true,
        _ => false,
    }
}

/// DML wrapped in a query body, as in `WITH src AS (...) INSERT INTO t ...`.
fn dml_body(body: &SetExpr) -> Option<&ast::Statement> {
    match body {
        SetExpr::Insert(statement) | SetExpr::Update(statement) => Some(statement),
        SetExpr::Query(query) => dml_body(&query.body),
        SetExpr::SetOperation { left, right, .. } => dml_body(left).or_else(|| dml_body(right)),
        _ => None,
    }
}

fn top_level_selects<'a>(body: &'a SetExpr, out: &mut Vec<&'a Select>) {
    match body {
        SetExpr::Select(select) => out.push(select),
        SetExpr::Query(query) => top_level_selects(&query.body, out),
        SetExpr::SetOperation { left, right, .. } => {
            top_level_selects(left, out);
            top_level_selects(right, out);
        }
        _ => {}
    }
}

fn has_group_by(select: &Select) -> bool {
    match &select.group_by {
        GroupByExpr::All => true,
        GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
    }
}

/// Finds a plain aggregate call outside any subquery. Window calls
/// (`SUM(x) OVER (...)`) do not count.
#[derive(Default)]
struct AggregateFinder {
    query_depth: usize,
}

impl Visitor for AggregateFinder {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.query_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.query_depth == 0 {
            if let Expr::Function(func) = expr {
                if func.over.is_none() && is_aggregate_name(&func.name) {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn is_aggregate_name(name: &ObjectName) -> bool {
    name.0
        .last()
        .map(|ident| AGGREGATE_FUNCTIONS.contains(&ident.value.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn projection_has_aggregate(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        let mut finder = AggregateFinder::default();
        item.visit(&mut finder).is_break()
    })
}

/// Stops at the first query whose FROM lists several relations or joins.
/// Subqueries are visited on their own, so the check stays shallow.
struct JoinFinder;

impl Visitor for JoinFinder {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if set_expr_has_join(&query.body) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

fn has_join(tree: &ast::Statement) -> bool {
    tree.visit(&mut JoinFinder).is_break()
}

fn set_expr_has_join(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => {
            select.from.len() > 1 || select.from.iter().any(table_with_joins_has_join)
        }
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_has_join(left) || set_expr_has_join(right)
        }
        _ => false,
    }
}

fn table_with_joins_has_join(table: &TableWithJoins) -> bool {
    if !table.joins.is_empty() {
        return true;
    }
    match &table.relation {
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => table_with_joins_has_join(table_with_joins),
        _ => false,
    }
}

#[derive(Default)]
struct CteCollector {
    names: HashSet<String>,
}

impl Visitor for CteCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.names.insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Names of every CTE defined anywhere in the tree, lowercased.
pub fn cte_names(tree: &ast::Statement) -> HashSet<String> {
    let mut collector = CteCollector::default();
    let _ = tree.visit(&mut collector);
    collector.names
}

/// Tables in order of first appearance, CTE references excluded.
fn referenced_tables(tree: &ast::Statement) -> Vec<String> {
    let ctes = cte_names(tree);
    let mut tables: Vec<String> = Vec::new();

    let _ = visit_relations(tree, |name: &ObjectName| {
        let table = object_name(name);
        let is_cte = name.0.len() == 1 && ctes.contains(&table.to_ascii_lowercase());
        if !is_cte && !tables.contains(&table) {
            tables.push(table);
        }
        ControlFlow::<()>::Continue(())
    });

    tables
}

/// Maps the aliases and names visible in one SELECT's FROM clause to
/// base table names.
struct TableScope {
    tables: Vec<String>,
    aliases: HashMap<String, String>,
}

impl TableScope {
    fn from_select(select: &Select) -> Self {
        let mut scope = TableScope {
            tables: Vec::new(),
            aliases: HashMap::new(),
        };
        for table in &select.from {
            scope.add_factor(&table.relation);
            for join in &table.joins {
                scope.add_factor(&join.relation);
            }
        }
        scope
    }

    fn add_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let base = base_table_name(&object_name(name));
                if let Some(alias) = alias {
                    self.aliases
                        .insert(alias.name.value.to_ascii_lowercase(), base.clone());
                }
                self.aliases.insert(base.clone(), base.clone());
                self.tables.push(base);
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.add_factor(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.add_factor(&join.relation);
                }
            }
            _ => {}
        }
    }

    fn resolve(&self, qualifier: &str) -> Option<String> {
        self.aliases.get(&qualifier.to_ascii_lowercase()).cloned()
    }
}

fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out);
            conjuncts(right, out);
        }
        Expr::Nested(inner) => conjuncts(inner, out),
        other => out.push(other),
    }
}

/// `(qualifier, column)` for a plain or qualified column reference.
fn column_ref(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(ident) => Some((None, ident.value.clone())),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let column = parts[parts.len() - 1].value.clone();
            let qualifier = parts[parts.len() - 2].value.clone();
            Some((Some(qualifier), column))
        }
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

fn is_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Value(_) | Expr::TypedString { .. } => true,
        Expr::UnaryOp {
            op: UnaryOperator::Minus | UnaryOperator::Plus,
            expr,
        } => matches!(expr.as_ref(), Expr::Value(ast::Value::Number(..))),
        Expr::Nested(inner) => is_literal(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> FeatureSet {
        Classifier::default().classify(sql).unwrap()
    }

    #[test]
    fn test_key_lookup() {
        let features = classify("SELECT * FROM users WHERE id = 1");
        assert!(features.has_key_equality);
        assert!(!features.is_write);
        assert!(!features.has_join);
        assert_eq!(features.referenced_tables, vec!["users".to_string()]);
    }

    #[test]
    fn test_key_equality_needs_literal() {
        let features = classify("SELECT * FROM users WHERE id = other_id");
        assert!(!features.has_key_equality);

        let features = classify("SELECT * FROM users WHERE id > 1");
        assert!(!features.has_key_equality);
    }

    #[test]
    fn test_key_equality_inside_conjunction() {
        let features = classify("SELECT * FROM users WHERE (status = 'active' AND id = -3)");
        assert!(features.has_key_equality);

        let features = classify("SELECT * FROM users WHERE id = 1 OR id = 2");
        assert!(!features.has_key_equality);
    }

    #[test]
    fn test_key_equality_ignores_subquery_predicates() {
        let features =
            classify("SELECT * FROM users WHERE name IN (SELECT name FROM admins WHERE id = 1)");
        assert!(!features.has_key_equality);
    }

    #[test]
    fn test_key_column_is_configurable_per_table() {
        let classifier = Classifier::default().with_key_column("orders", "order_id");

        let features = classifier
            .classify("SELECT * FROM orders o WHERE o.order_id = 42")
            .unwrap();
        assert!(features.has_key_equality);

        let features = classifier
            .classify("SELECT * FROM orders WHERE id = 42")
            .unwrap();
        assert!(!features.has_key_equality);

        let features = classifier
            .classify("SELECT * FROM users u WHERE u.id = 42")
            .unwrap();
        assert!(features.has_key_equality);
    }

    #[test]
    fn test_aggregate_top_level_only() {
        assert!(classify("SELECT count(*) FROM users").has_aggregate);
        assert!(classify("SELECT role, SUM(orders) + 1 FROM users GROUP BY role").has_aggregate);
        assert!(
            !classify("SELECT name FROM users WHERE age > (SELECT AVG(age) FROM users)")
                .has_aggregate
        );
        assert!(!classify("SELECT name, SUM(x) OVER (PARTITION BY role) FROM users").has_aggregate);
    }

    #[test]
    fn test_group_by() {
        let features = classify("SELECT role FROM users GROUP BY role");
        assert!(features.has_group_by);
        assert!(!features.has_aggregate);
        assert!(!classify("SELECT role FROM users").has_group_by);
    }

    #[test]
    fn test_join_detection() {
        assert!(
            classify("SELECT u.name, o.id FROM users u JOIN orders o ON u.id = o.user_id").has_join
        );
        assert!(classify("SELECT * FROM users, orders").has_join);
        assert!(
            classify("SELECT * FROM (SELECT * FROM a JOIN b ON a.id = b.id) t").has_join
        );
        assert!(!classify("SELECT * FROM users WHERE id IN (SELECT user_id FROM orders)").has_join);
    }

    #[test]
    fn test_writes() {
        for sql in [
            "INSERT INTO users VALUES (1, 'Bob')",
            "UPDATE users SET name = 'Alice' WHERE id = 1",
            "DELETE FROM users WHERE id = 1",
            "CREATE TABLE t (id INT)",
            "ALTER TABLE t ADD COLUMN name TEXT",
            "DROP TABLE t",
        ] {
            assert!(classify(sql).is_write, "{sql} should be a write");
        }
    }

    #[test]
    fn test_ddl_beyond_tables_is_a_write() {
        for sql in [
            "CREATE SEQUENCE order_seq",
            "CREATE ROLE analyst",
            "CREATE TYPE address AS (street TEXT, city TEXT)",
            "CREATE SCHEMA staging",
            "CREATE VIEW admins AS SELECT * FROM users WHERE role = 'Admin'",
            "DROP FUNCTION add",
            "DROP SEQUENCE order_seq",
            "DROP TABLE users, orders",
            "TRUNCATE TABLE users",
        ] {
            assert!(classify(sql).is_write, "{sql} should be a write");
        }
    }

    #[test]
    fn test_cte_prefixed_insert_is_a_write() {
        let classifier = Classifier::default();
        let sql = "WITH src AS (SELECT * FROM staging) INSERT INTO users SELECT * FROM src";
        let statement = classifier.parse(sql).unwrap();

        assert!(classifier.features(&statement).is_write);
        assert!(!statement.is_query());
        assert_eq!(statement.write_target(), Some("users".to_string()));
    }

    #[test]
    fn test_referenced_tables_skip_ctes_and_dedupe() {
        let features = classify(
            "WITH recent AS (SELECT * FROM orders) \
             SELECT * FROM recent JOIN users ON recent.user_id = users.id \
             WHERE users.id IN (SELECT user_id FROM orders)",
        );
        assert_eq!(
            features.referenced_tables,
            vec!["orders".to_string(), "users".to_string()]
        );
    }

    #[test]
    fn test_parse_errors() {
        let classifier = Classifier::new(32);
        assert!(matches!(
            classifier.classify("SELECT * FORM users"),
            Err(ParseError::Syntax(_))
        ));
        assert_eq!(classifier.classify("   "), Err(ParseError::Empty));
        assert_eq!(
            classifier.classify("SELECT 1; SELECT 2"),
            Err(ParseError::MultipleStatements(2))
        );
        assert_eq!(
            classifier.classify(&format!("SELECT '{}'", "x".repeat(40))),
            Err(ParseError::TooLarge { size: 49, limit: 32 })
        );
    }

    #[test]
    fn test_write_target() {
        let classifier = Classifier::default();
        let target = |sql: &str| classifier.parse(sql).unwrap().write_target();

        assert_eq!(target("INSERT INTO app.users VALUES (1)"), Some("app.users".to_string()));
        assert_eq!(target("UPDATE users SET a = 1"), Some("users".to_string()));
        assert_eq!(target("DROP TABLE users"), Some("users".to_string()));

        let dropped = classifier.parse("DROP TABLE users, app.orders").unwrap();
        assert_eq!(dropped.dropped_tables(), vec!["users".to_string(), "app.orders".to_string()]);
        assert!(classifier.parse("DROP VIEW admins").unwrap().dropped_tables().is_empty());
    }

    #[test]
    fn test_base_table_name() {
        assert_eq!(base_table_name("iceberg.public.Users"), "users");
        assert_eq!(base_table_name("\"Orders\""), "orders");
    }
}
