//! SQL text for the statements the core issues. SQLite dialect only.

/// Quotes an identifier; dotted names are quoted per segment (`main.t` -> `"main"."t"`).
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_template(width: usize) -> String {
    format!("({})", vec!["?"; width].join(", "))
}

/// Multi-row upsert for `rows` rows.
///
/// Columns in `on_duplicate` take the incoming value on conflict; every other column keeps the
/// stored one. With no update columns a conflicting row is left untouched.
pub fn upsert_sql(table: &str, columns: &[String], on_duplicate: &[String], rows: usize) -> String {
    let template = row_template(columns.len());
    let values = vec![template.as_str(); rows.max(1)].join(", ");

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(table),
        column_list(columns),
        values
    );

    if on_duplicate.is_empty() {
        sql.push_str(" ON CONFLICT DO NOTHING");
        return sql;
    }

    let assignments = on_duplicate
        .iter()
        .map(|c| {
            let quoted = quote_identifier(c);
            format!("{quoted} = excluded.{quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(" ON CONFLICT DO UPDATE SET ");
    sql.push_str(&assignments);
    sql
}

/// Single-row insert reporting the generated key in `returning`. A row that would violate a
/// unique constraint is skipped and reports nothing.
pub fn insert_returning_sql(table: &str, columns: &[String], returning: &str) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT DO NOTHING RETURNING {}",
        quote_identifier(table),
        column_list(columns),
        row_template(columns.len()),
        quote_identifier(returning)
    )
}

/// Moves one row to a new key: `UPDATE <table> SET <key> = ? WHERE <key> = ?`.
pub fn update_key_sql(table: &str, key: &str) -> String {
    let key = quote_identifier(key);
    format!("UPDATE {} SET {key} = ? WHERE {key} = ?", quote_identifier(table))
}

/// `SELECT <select> FROM <table> WHERE c1 IN (?, ...) AND c2 IN (?, ...)`.
/// Each condition is a column and the number of values bound for it.
pub fn select_in_sql(table: &str, select: &[&str], conditions: &[(&str, usize)]) -> String {
    let select = select
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {select} FROM {}", quote_identifier(table));
    let predicates = conditions
        .iter()
        .map(|(column, count)| {
            if *count == 0 {
                "1 = 0".to_string()
            } else {
                format!(
                    "{} IN ({})",
                    quote_identifier(column),
                    vec!["?"; *count].join(", ")
                )
            }
        })
        .collect::<Vec<_>>();
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn renders_upsert_with_update_list() {
        let sql = upsert_sql("product", &cols(&["id", "name"]), &cols(&["name"]), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"product\" (\"id\", \"name\") VALUES (?, ?), (?, ?) \
             ON CONFLICT DO UPDATE SET \"name\" = excluded.\"name\""
        );
    }

    #[test]
    fn renders_do_nothing_without_update_list() {
        let sql = upsert_sql("product", &cols(&["id"]), &[], 1);
        assert_eq!(
            sql,
            "INSERT INTO \"product\" (\"id\") VALUES (?) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn quotes_dotted_and_embedded_quotes() {
        assert_eq!(quote_identifier("main.t"), "\"main\".\"t\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn renders_select_in() {
        let sql = select_in_sql("t", &["id", "sku"], &[("sku", 3), ("store", 1)]);
        assert_eq!(
            sql,
            "SELECT \"id\", \"sku\" FROM \"t\" WHERE \"sku\" IN (?, ?, ?) AND \"store\" IN (?)"
        );
        assert!(select_in_sql("t", &["id"], &[("sku", 0)]).ends_with("WHERE 1 = 0"));
    }

    #[test]
    fn renders_key_update() {
        assert_eq!(
            update_key_sql("t", "id"),
            "UPDATE \"t\" SET \"id\" = ? WHERE \"id\" = ?"
        );
    }

    #[test]
    fn renders_insert_returning() {
        assert_eq!(
            insert_returning_sql("t", &cols(&["a", "b"]), "id"),
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES (?, ?) ON CONFLICT DO NOTHING RETURNING \"id\""
        );
    }
}
