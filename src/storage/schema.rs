pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS storage_items (
    area TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (area, key)
);
"#;
