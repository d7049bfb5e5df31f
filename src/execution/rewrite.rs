//! Table-reference substitution
//!
//! Read statements bound for the lake-backed engines have their logical
//! table names swapped for the object-storage location of the table. The
//! layout is shared with the ingestion sidecar, which writes partitions as
//! `{warehouse}/{table}/year=YYYY/month=MM/day=DD/*.parquet`.

use crate::classifier::{base_table_name, cte_names, Statement};
use chrono::{Datelike, NaiveDate};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Ident, ObjectName, Query, SetExpr, TableAlias, TableFactor,
    TableWithJoins, Value, VisitMut, VisitorMut,
};
use std::collections::HashSet;
use std::ops::ControlFlow;
use tracing::debug;

/// Where lake tables live in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// HTTP endpoint of the object store, e.g. `http://minio:9000`
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            endpoint: "http://minio:9000".to_string(),
            bucket: "lake-data".to_string(),
            prefix: "data".to_string(),
            access_key: "admin".to_string(),
            secret_key: "password".to_string(),
            region: "us-east-1".to_string(),
        }
    }
}

impl StorageLayout {
    fn bucket_path(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}/{}", self.bucket, prefix)
        }
    }

    /// `s3://{bucket}/{prefix}`
    pub fn warehouse(&self) -> String {
        format!("s3://{}", self.bucket_path())
    }

    /// Directory the sidecar writes a table's rows for one day into.
    pub fn partition_path(&self, table: &str, date: NaiveDate) -> String {
        format!(
            "{}/{}/year={:04}/month={:02}/day={:02}",
            self.warehouse(),
            table,
            date.year(),
            date.month(),
            date.day()
        )
    }

    /// Glob over every partition of a table.
    pub fn table_glob(&self, table: &str) -> String {
        format!("{}/{}/{}", self.warehouse(), table, PARTITION_GLOB)
    }

    /// The same glob addressed over the HTTP endpoint.
    pub fn http_table_glob(&self, table: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket_path(),
            table,
            PARTITION_GLOB
        )
    }

    /// `host:port` of the endpoint without its scheme.
    pub fn endpoint_authority(&self) -> &str {
        let endpoint = self.endpoint.trim_end_matches('/');
        endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint)
    }

    pub fn uses_ssl(&self) -> bool {
        self.endpoint.starts_with("https://")
    }
}

const PARTITION_GLOB: &str = "year=*/month=*/day=*/*.parquet";

/// How a logical table is addressed on a given engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteTarget {
    /// DuckDB: `read_parquet('s3://…')`
    ParquetScan,
    /// ClickHouse: `s3('http://…', key, secret, 'Parquet')`
    S3Function,
    /// Trino resolves storage through its catalog: `catalog.schema.table`
    Catalog { catalog: String, schema: String },
}

#[derive(Debug, Clone)]
pub struct TableRewriter {
    layout: StorageLayout,
    target: RewriteTarget,
    /// Lowercase table names to rewrite. `None` rewrites every table.
    lake_tables: Option<HashSet<String>>,
}

impl TableRewriter {
    pub fn new(layout: StorageLayout, target: RewriteTarget) -> Self {
        Self {
            layout,
            target,
            lake_tables: None,
        }
    }

    pub fn with_lake_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lake_tables = Some(
            tables
                .into_iter()
                .map(|t| base_table_name(t.as_ref()))
                .collect(),
        );
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// SQL to send to the engine. Writes and unparsed input pass through
    /// untouched; queries are re-rendered from the rewritten tree.
    pub fn rewrite(&self, statement: &Statement) -> String {
        if !statement.is_query() {
            return statement.sql().to_string();
        }

        let mut tree = statement.tree().clone();
        let mut visitor = RewriteVisitor {
            rewriter: self,
            ctes: cte_names(statement.tree()),
            rewritten: 0,
        };
        let _ = tree.visit(&mut visitor);

        if visitor.rewritten == 0 {
            return statement.sql().to_string();
        }
        let sql = tree.to_string();
        debug!("Rewrote {} table reference(s): {}", visitor.rewritten, sql);
        sql
    }

    fn wants(&self, base: &str) -> bool {
        self.lake_tables
            .as_ref()
            .map(|tables| tables.contains(base))
            .unwrap_or(true)
    }

    /// Returns true when the factor was changed.
    fn rewrite_factor(&self, factor: &mut TableFactor, ctes: &HashSet<String>) -> bool {
        let TableFactor::Table {
            name, alias, args, ..
        } = factor
        else {
            return false;
        };
        // already a table function
        if args.is_some() {
            return false;
        }

        let parts = name.0.len();
        let Some(last) = name.0.last().cloned() else {
            return false;
        };
        let table = last.value.clone();
        let base = table.to_ascii_lowercase();
        if (parts == 1 && ctes.contains(&base)) || !self.wants(&base) {
            return false;
        }

        match &self.target {
            RewriteTarget::Catalog { catalog, schema } => match parts {
                1 => {
                    name.0 = vec![Ident::new(catalog), Ident::new(schema), last];
                }
                2 => {
                    name.0.insert(0, Ident::new(catalog));
                }
                _ => return false,
            },
            RewriteTarget::ParquetScan => {
                if parts != 1 {
                    return false;
                }
                *name = ObjectName(vec![Ident::new("read_parquet")]);
                *args = Some(vec![string_arg(self.layout.table_glob(&table))]);
            }
            RewriteTarget::S3Function => {
                if parts != 1 {
                    return false;
                }
                *name = ObjectName(vec![Ident::new("s3")]);
                *args = Some(vec![
                    string_arg(self.layout.http_table_glob(&table)),
                    string_arg(self.layout.access_key.clone()),
                    string_arg(self.layout.secret_key.clone()),
                    string_arg("Parquet".to_string()),
                ]);
            }
        }

        if alias.is_none() {
            *alias = Some(TableAlias {
                name: Ident::new(table),
                columns: vec![],
            });
        }
        true
    }
}

fn string_arg(value: String) -> FunctionArg {
    FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(Value::SingleQuotedString(
        value,
    ))))
}

/// Rewrites the FROM clauses owned directly by each query. Derived tables,
/// CTE bodies and expression subqueries are queries of their own and get
/// their own visit.
struct RewriteVisitor<'a> {
    rewriter: &'a TableRewriter,
    ctes: HashSet<String>,
    rewritten: usize,
}

impl RewriteVisitor<'_> {
    fn rewrite_set_expr(&mut self, body: &mut SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table in select.from.iter_mut() {
                    self.rewrite_table_with_joins(table);
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_set_expr(left);
                self.rewrite_set_expr(right);
            }
            _ => {}
        }
    }

    fn rewrite_table_with_joins(&mut self, table: &mut TableWithJoins) {
        self.rewrite_table_factor(&mut table.relation);
        for join in table.joins.iter_mut() {
            self.rewrite_table_factor(&mut join.relation);
        }
    }

    fn rewrite_table_factor(&mut self, factor: &mut TableFactor) {
        if let TableFactor::NestedJoin {
            table_with_joins, ..
        } = factor
        {
            self.rewrite_table_with_joins(table_with_joins);
        } else if self.rewriter.rewrite_factor(factor, &self.ctes) {
            self.rewritten += 1;
        }
    }
}

impl VisitorMut for RewriteVisitor<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        self.rewrite_set_expr(&mut query.body);
        ControlFlow::Continue(())
    }
}
