//! Tests for the migration script parser
//!
//! Covers block headers, statement splitting, whitespace collapsing and the
//! three quoting contexts.

#[cfg(test)]
mod tests {
    use crate::definitions::MigrationStep;
    use crate::error::{MigrateError, ParseError};
    use crate::script::*;

    const SAMPLE_SCRIPT: &str = r#"
# Simple table with single quotes in the default values
CREATE TABLE "Employee" (
	"EmployeeID" SERIAL PRIMARY KEY,
	"FirstName" VARCHAR(100) NOT NULL,
	"LastName" VARCHAR(100) NOT NULL,
	"DateOfBirth" DATE NOT NULL DEFAULT '1990-01-01'
);

# Table with special characters in column names
CREATE TABLE "Order-Details" (
	"Order_ID" INT,
	"Product_Name" VARCHAR(255) DEFAULT 'unknown',
	"Unit_Price" NUMERIC(10, 2) DEFAULT '0.00',
	"Quantity" INT DEFAULT '1',
	PRIMARY KEY ("Order_ID", "Product_Name")
);

# Creating an index on the FirstName and LastName columns
CREATE INDEX "idx_employee_name" ON "Employee" ("FirstName", "LastName");

# Creating a unique index using a function
CREATE UNIQUE INDEX "idx_lower_last_name" ON "Employee" (LOWER("LastName"));

# A function to calculate age from the DateOfBirth
CREATE FUNCTION "calculate_age" ("dob" DATE) RETURNS INT AS $$
BEGIN
    RETURN DATE_PART('year', AGE("dob"));
END;
$$ LANGUAGE plpgsql;

# A function to concatenate first and last name with a space between
CREATE FUNCTION "full_name" ("first" TEXT, "last" TEXT) RETURNS TEXT AS $tag$
BEGIN
    RETURN "first" || ' ' || "last";
END;
$tag$ LANGUAGE plpgsql;
"#;

    fn step(name: &str, sequence_no: u32, sql: &str) -> MigrationStep {
        MigrationStep::new(name, sequence_no, sql)
    }

    #[test]
    fn test_sample_script_has_one_step_per_block() {
        let steps = parse_script(SAMPLE_SCRIPT).unwrap();

        assert_eq!(steps.len(), 6);
        assert!(steps.iter().all(|s| s.sequence_no == 1));
        assert_eq!(steps[0].name, "Simple table with single quotes in the default values");
        assert_eq!(steps[3].name, "Creating a unique index using a function");
        assert_eq!(
            steps[5].name,
            "A function to concatenate first and last name with a space between"
        );
    }

    #[test]
    fn test_sample_script_statement_text() {
        let steps = parse_script(SAMPLE_SCRIPT).unwrap();

        assert_eq!(
            steps[0].sql,
            "CREATE TABLE \"Employee\" ( \"EmployeeID\" SERIAL PRIMARY KEY, \"FirstName\" VARCHAR(100) NOT NULL, \
             \"LastName\" VARCHAR(100) NOT NULL, \"DateOfBirth\" DATE NOT NULL DEFAULT '1990-01-01' );"
        );
        assert_eq!(
            steps[2].sql,
            "CREATE INDEX \"idx_employee_name\" ON \"Employee\" (\"FirstName\", \"LastName\");"
        );

        // Dollar-quoted bodies keep their inner semicolons and layout
        assert_eq!(
            steps[4].sql,
            "CREATE FUNCTION \"calculate_age\" (\"dob\" DATE) RETURNS INT AS $$\nBEGIN\n    \
             RETURN DATE_PART('year', AGE(\"dob\"));\nEND;\n$$ LANGUAGE plpgsql;"
        );
        assert!(steps[5].sql.contains("$tag$\nBEGIN\n    RETURN \"first\" || ' ' || \"last\";\nEND;\n$tag$"));
        assert!(steps[5].sql.ends_with("$tag$ LANGUAGE plpgsql;"));
    }

    #[test]
    fn test_sequence_restarts_per_block() {
        let steps = parse_script("# a\nSELECT 1;\nSELECT 2;\n# b\nSELECT 3;\n").unwrap();

        assert_eq!(
            steps,
            vec![
                step("a", 1, "SELECT 1;"),
                step("a", 2, "SELECT 2;"),
                step("b", 1, "SELECT 3;"),
            ]
        );
    }

    #[test]
    fn test_doubled_single_quote_stays_in_string() {
        let steps = parse_script("# q\nINSERT INTO t VALUES ('it''s ok; really');").unwrap();

        assert_eq!(steps, vec![step("q", 1, "INSERT INTO t VALUES ('it''s ok; really');")]);
    }

    #[test]
    fn test_whitespace_collapses_outside_quotes() {
        let steps = parse_script("# w\n  SELECT\n\t1 ,\n   'a   b'  ;").unwrap();

        assert_eq!(steps, vec![step("w", 1, "SELECT 1 , 'a   b';")]);
    }

    #[test]
    fn test_quoted_identifier_with_backslash_escape() {
        let steps = parse_script("# i\nSELECT \"a\\\"; b\" FROM t;").unwrap();

        assert_eq!(steps, vec![step("i", 1, "SELECT \"a\\\"; b\" FROM t;")]);
    }

    #[test]
    fn test_block_name_is_trimmed() {
        let steps = parse_script("# -- v1->v2 ==\nSELECT 1;\n#=== v3 ===#\nSELECT 2;").unwrap();

        assert_eq!(steps[0].name, "v1->v2");
        assert_eq!(steps[1].name, "v3");
    }

    #[test]
    fn test_long_block_name_is_truncated() {
        let script = format!("# {}\nSELECT 1;", "x".repeat(300));
        let steps = parse_script(&script).unwrap();
        assert_eq!(steps[0].name.len(), 255);

        // Never split a multi-byte character
        let script = format!("# {}\nSELECT 1;", "é".repeat(200));
        let steps = parse_script(&script).unwrap();
        assert_eq!(steps[0].name.len(), 254);
        assert_eq!(steps[0].name.chars().count(), 127);
    }

    #[test]
    fn test_last_statement_without_terminator() {
        let steps = parse_script("# a\nSELECT 1;\nSELECT 2\n\n").unwrap();

        assert_eq!(steps, vec![step("a", 1, "SELECT 1;"), step("a", 2, "SELECT 2;")]);
    }

    #[test]
    fn test_empty_statements_are_skipped() {
        let steps = parse_script("# a\n;;\nSELECT 1;;").unwrap();

        assert_eq!(steps, vec![step("a", 1, "SELECT 1;")]);
    }

    #[test]
    fn test_scripts_without_statements() {
        assert!(parse_script("").unwrap().is_empty());
        assert!(parse_script("\n   \n").unwrap().is_empty());
        assert!(parse_script("# a\n# b\n").unwrap().is_empty());
    }

    #[test]
    fn test_inline_comments_are_discarded() {
        let steps = parse_script("# a\nSELECT 1 # not; the end\n, 2;").unwrap();
        assert_eq!(steps, vec![step("a", 1, "SELECT 1 , 2;")]);

        // After a terminator on the same line, `#` is a comment
        let steps = parse_script("# a\nSELECT 1; # note\nSELECT 2;").unwrap();
        assert_eq!(steps, vec![step("a", 1, "SELECT 1;"), step("a", 2, "SELECT 2;")]);
    }

    #[test]
    fn test_hash_line_inside_statement_is_a_comment() {
        let steps = parse_script("# a\nSELECT 1\n# b\n;\nSELECT 2;").unwrap();

        assert_eq!(steps, vec![step("a", 1, "SELECT 1;"), step("a", 2, "SELECT 2;")]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let steps = parse_script("# a\r\nSELECT 1;\r\n# b\r\nSELECT\r\n2;\r\n").unwrap();

        assert_eq!(steps, vec![step("a", 1, "SELECT 1;"), step("b", 1, "SELECT 2;")]);
    }

    #[test]
    fn test_statement_outside_block() {
        assert_eq!(parse_script("SELECT 1;"), Err(ParseError::OutsideBlock { line: 1 }));
        assert_eq!(
            parse_script("\n\n  SELECT 1;\n# a\n"),
            Err(ParseError::OutsideBlock { line: 3 })
        );
    }

    #[test]
    fn test_empty_block_name() {
        assert_eq!(
            parse_script("# a\nSELECT 1;\n#  -- \nSELECT 2;"),
            Err(ParseError::EmptyBlockName { line: 3 })
        );
    }

    #[test]
    fn test_unterminated_quotes() {
        assert_eq!(
            parse_script("# a\nSELECT 'abc;"),
            Err(ParseError::UnterminatedString { line: 2 })
        );
        assert_eq!(
            parse_script("# a\nSELECT \"abc;"),
            Err(ParseError::UnterminatedIdentifier { line: 2 })
        );
        assert_eq!(
            parse_script("# a\n\nSELECT $x$ abc;"),
            Err(ParseError::UnterminatedDollarQuote {
                tag: "$x$".to_string(),
                line: 3
            })
        );
    }

    #[test]
    fn test_malformed_dollar_tag() {
        let err = parse_script("# a\nSELECT $1;").unwrap_err();

        assert_eq!(err, ParseError::InvalidDollarTag { line: 2 });
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_parse_failure_returns_no_steps() {
        // Earlier valid statements are not returned on error
        let result = parse_script("# a\nSELECT 1;\nSELECT 'open");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let err = parse_script_bytes(b"# a\nSELECT '\xff';").unwrap_err();

        assert_eq!(err, ParseError::InvalidEncoding { offset: 12, line: 2 });
    }

    #[test]
    fn test_parse_bytes_matches_parse_str() {
        let steps = parse_script_bytes(SAMPLE_SCRIPT.as_bytes()).unwrap();
        assert_eq!(steps, parse_script(SAMPLE_SCRIPT).unwrap());
    }

    #[test]
    fn test_load_script_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.sql");
        std::fs::write(&path, "# v1\nCREATE TABLE a (id int);\nCREATE TABLE b (id int);\n").unwrap();

        let steps = load_script(&path).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], step("v1", 2, "CREATE TABLE b (id int);"));

        match load_script(dir.path().join("missing.sql")) {
            Err(MigrateError::Io(_)) => {}
            other => panic!("Expected IO error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_on_char_boundary("hello", 10), "hello");
        assert_eq!(truncate_on_char_boundary("hello", 3), "hel");
        assert_eq!(truncate_on_char_boundary("aé", 2), "a");
    }
}
