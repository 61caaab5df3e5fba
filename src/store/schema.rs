pub const ENGINE_SCHEMA_SQL: &str = include_str!("../../sql/engine_schema.sql");

pub const SCHEMA_VERSION: &str = "1.0.0";

pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut prev = '\0';

    for ch in sql.chars() {
        match ch {
            '\'' if !in_double_quote && prev != '\\' => {
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
            }
            ';' if !in_single_quote && !in_double_quote => {
                let stmt = strip_comment_lines(&current);
                if !stmt.is_empty() {
                    statements.push(stmt);
                }
                current.clear();
                prev = ch;
                continue;
            }
            _ => {}
        }

        current.push(ch);
        prev = ch;
    }

    let tail = strip_comment_lines(&current);
    if !tail.is_empty() {
        statements.push(tail);
    }

    statements
}

fn strip_comment_lines(stmt: &str) -> String {
    stmt.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_semicolons_outside_quotes() {
        let sql = "-- header\nCREATE TABLE \"a;b\" (x TEXT DEFAULT ';');\nINSERT INTO t VALUES (1)";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE \"a;b\""));
        assert_eq!(statements[1], "INSERT INTO t VALUES (1)");
    }

    #[test]
    fn engine_schema_has_every_table() {
        let statements = split_sql_statements(ENGINE_SCHEMA_SQL);
        for table in [
            "courses",
            "learning_nodes",
            "learning_edges",
            "mastery_states",
            "review_schedules",
            "course_progress",
        ] {
            let needle = format!("CREATE TABLE IF NOT EXISTS \"{table}\"");
            assert!(statements.iter().any(|s| s.starts_with(&needle)), "missing {table}");
        }
    }
}
