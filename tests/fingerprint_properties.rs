use collection_engine::{fingerprint, normalize};

#[test]
fn test_literal_variants_share_fingerprint() {
    let variants = [
        "SELECT * FROM users WHERE id = 1",
        "select * from users where id = 123456",
        "SELECT *\n  FROM users\n WHERE id = $1",
        "select * from users where id = ?",
        "/* request 42 */ SELECT * FROM users WHERE id = -7 -- retry",
        "SELECT * FROM users WHERE id = 1;",
    ];

    let expected = fingerprint(variants[0]);
    for variant in &variants[1..] {
        assert_eq!(fingerprint(variant), expected, "variant: {variant}");
    }
    assert_eq!(expected.normalized(), "select * from users where id = ?");
}

#[test]
fn test_structurally_different_statements_differ() {
    let a = fingerprint("select * from users where id = 1");
    let b = fingerprint("select * from accounts where id = 1");
    let c = fingerprint("select * from users where email = 'x'");
    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
    assert_ne!(b.id(), c.id());
}

#[test]
fn test_in_lists_of_any_length_match() {
    let short = fingerprint("SELECT name FROM items WHERE id IN (1)");
    let long = fingerprint("select name from items where id in (1, 2, 3, 4, 5, 6, 7, 8)");
    let params = fingerprint("select name from items where id in ($1, $2, $3)");
    assert_eq!(short, long);
    assert_eq!(short, params);
}

#[test]
fn test_multi_row_values_collapse() {
    let one = normalize("INSERT INTO t (a, b) VALUES (1, 'x')");
    let many = normalize("insert into t (a, b) values (1, 'x'), (2, 'y'), (3, 'z')");
    assert_eq!(one, many);
}

#[test]
fn test_no_literal_survives_normalization() {
    let raw = "UPDATE accounts SET email = 'alice@example.com', balance = 1024.50 \
               WHERE ssn = '123-45-6789' AND token = $tok$secret$tok$";
    let normalized = normalize(raw);

    for secret in ["alice@example.com", "1024.50", "123-45-6789", "secret"] {
        assert!(
            !normalized.contains(secret),
            "`{secret}` leaked into `{normalized}`"
        );
    }
    assert_eq!(
        normalized,
        "update accounts set email = ?, balance = ? where ssn = ? and token = ?"
    );
}

#[test]
fn test_quoted_identifiers_keep_case() {
    let a = fingerprint(r#"SELECT "Id" FROM "Users""#);
    let b = fingerprint(r#"SELECT "id" FROM "users""#);
    assert_ne!(a, b);
    assert_eq!(a.normalized(), r#"select "Id" from "Users""#);
}

#[test]
fn test_normalization_is_idempotent() {
    let inputs = [
        "SELECT a, b FROM t WHERE c = 'd' AND e IN (1, 2, 3) ORDER BY a LIMIT 10",
        "with x as (select 1) select * from x",
        "DELETE FROM t WHERE ts < now() - interval '7 days'",
        "select count(*) filter (where x > 0) from t",
        "",
    ];
    for input in inputs {
        let once = normalize(input);
        assert_eq!(normalize(&once), once, "input: {input}");
        assert_eq!(fingerprint(&once), fingerprint(input), "input: {input}");
    }
}

#[test]
fn test_fingerprint_is_deterministic() {
    let text = "select * from orders where customer_id = 42 and status = 'open'";
    let first = fingerprint(text);
    for _ in 0..100 {
        assert_eq!(fingerprint(text).id(), first.id());
    }
    assert_eq!(first.hex().len(), 16);
}

#[test]
fn test_statement_type_is_derived() {
    assert_eq!(fingerprint("SELECT 1").statement_type(), "select");
    assert_eq!(fingerprint("update t set a = 1").statement_type(), "update");
    assert_eq!(fingerprint("DELETE FROM t").statement_type(), "delete");
    assert_eq!(fingerprint("BEGIN").statement_type(), "transaction");
    assert_eq!(fingerprint("create table t (a int)").statement_type(), "ddl");
}
