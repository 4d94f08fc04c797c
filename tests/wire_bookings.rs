use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use staybnb::engine::Engine;
use staybnb::identity::{IdentityResolver, SharedSecret, UserTable};
use staybnb::model::OccupancyPolicy;
use staybnb::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(identity: Arc<dyn IdentityResolver>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("staybnb_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("staybnb.wal"), OccupancyPolicy::default()).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, identity, None).await;
            });
        }
    });

    addr
}

async fn start_default_server() -> SocketAddr {
    start_test_server(Arc::new(SharedSecret::new("staybnb".into()))).await
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    try_connect(addr, "staybnb", "staybnb").await.unwrap()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn list_property(client: &tokio_postgres::Client) -> Ulid {
    let pid = Ulid::new();
    let host = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO properties (id, host_id, nightly_rate, max_guests, name) \
             VALUES ('{pid}', '{host}', 15000, 4, 'Harbour loft')"
        ))
        .await
        .unwrap();
    pid
}

async fn book(
    client: &tokio_postgres::Client,
    pid: Ulid,
    check_in: &str,
    check_out: &str,
) -> Result<Ulid, tokio_postgres::Error> {
    let bid = Ulid::new();
    let guest = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, property_id, guest_id, check_in, check_out, guests) \
             VALUES ('{bid}', '{pid}', '{guest}', '{check_in}', '{check_out}', 2)"
        ))
        .await?;
    Ok(bid)
}

fn sqlstate(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

async fn disabled_dates(client: &tokio_postgres::Client, pid: Ulid) -> String {
    let rows = rows(
        client,
        &format!("SELECT * FROM disabled_dates WHERE property_id = '{pid}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    rows[0].get("dates").unwrap().to_string()
}

// ── Properties and bookings ──────────────────────────────────

#[tokio::test]
async fn list_property_and_book() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    let properties = rows(&client, "SELECT * FROM properties").await;
    assert_eq!(properties.len(), 1);
    assert_eq!(properties[0].get("id"), Some(pid.to_string().as_str()));
    assert_eq!(properties[0].get("name"), Some("Harbour loft"));
    let one = rows(&client, &format!("SELECT * FROM properties WHERE id = '{pid}'")).await;
    assert_eq!(one[0].get("nightly_rate"), Some("15000"));
    let none = rows(&client, &format!("SELECT * FROM properties WHERE id = '{}'", Ulid::new())).await;
    assert!(none.is_empty());

    let bid = book(&client, pid, "2025-01-10", "2025-01-13").await.unwrap();
    let bookings = rows(&client, &format!("SELECT * FROM bookings WHERE property_id = '{pid}'")).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("id"), Some(bid.to_string().as_str()));
    assert_eq!(bookings[0].get("check_in"), Some("2025-01-10"));
    assert_eq!(bookings[0].get("total_price"), Some("45000"));
    assert_eq!(bookings[0].get("status"), Some("pending"));

    let single = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(single.len(), 1);
}

#[tokio::test]
async fn overlapping_booking_is_refused() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    book(&client, pid, "2025-01-10", "2025-01-14").await.unwrap();
    let err = book(&client, pid, "2025-01-12", "2025-01-16").await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains("these dates are unavailable"), "got: {message}");

    // Back-to-back stays share a changeover day and do not collide.
    book(&client, pid, "2025-01-14", "2025-01-16").await.unwrap();
}

#[tokio::test]
async fn inverted_stay_is_invalid() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    let err = book(&client, pid, "2025-01-14", "2025-01-10").await.unwrap_err();
    assert_eq!(sqlstate(&err), "22007");
    let err = book(&client, pid, "2025-01-14", "2025-01-14").await.unwrap_err();
    assert_eq!(sqlstate(&err), "22007");
}

#[tokio::test]
async fn unknown_property_booking_not_found() {
    let addr = start_default_server().await;
    let client = connect(addr).await;

    let err = book(&client, Ulid::new(), "2025-01-10", "2025-01-12").await.unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

// ── Blocked dates ────────────────────────────────────────────

#[tokio::test]
async fn blocked_dates_rows() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    book(&client, pid, "2025-01-10", "2025-01-12").await.unwrap();
    book(&client, pid, "2025-01-12", "2025-01-13").await.unwrap();

    let dates: Vec<String> = rows(&client, &format!("SELECT * FROM blocked_dates WHERE property_id = '{pid}'"))
        .await
        .iter()
        .map(|r| r.get("date").unwrap().to_string())
        .collect();
    // The shared 2025-01-12 appears once.
    assert_eq!(dates, vec!["2025-01-10", "2025-01-11", "2025-01-12", "2025-01-13"]);
}

#[tokio::test]
async fn disabled_dates_json() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    assert_eq!(disabled_dates(&client, pid).await, "[]");

    book(&client, pid, "2025-01-10", "2025-01-12").await.unwrap();
    assert_eq!(
        disabled_dates(&client, pid).await,
        r#"["2025-01-10","2025-01-11","2025-01-12"]"#
    );
}

#[tokio::test]
async fn unknown_property_has_no_blocked_dates() {
    let addr = start_default_server().await;
    let client = connect(addr).await;

    assert_eq!(disabled_dates(&client, Ulid::new()).await, "[]");
    let none = rows(
        &client,
        &format!("SELECT * FROM blocked_dates WHERE property_id = '{}'", Ulid::new()),
    )
    .await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn overlap_query() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;
    book(&client, pid, "2025-01-10", "2025-01-14").await.unwrap();

    let overlaps = |a: &str, b: &str| {
        format!("SELECT * FROM overlaps WHERE property_id = '{pid}' AND check_in = '{a}' AND check_out = '{b}'")
    };
    let hit = rows(&client, &overlaps("2025-01-13", "2025-01-15")).await;
    assert_eq!(hit[0].get("has_overlap"), Some("t"));
    let touching = rows(&client, &overlaps("2025-01-14", "2025-01-16")).await;
    assert_eq!(touching[0].get("has_overlap"), Some("f"));
}

#[tokio::test]
async fn cancellation_frees_dates() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    let bid = book(&client, pid, "2025-01-10", "2025-01-14").await.unwrap();
    client
        .batch_execute(&format!("INSERT INTO confirmations (booking_id) VALUES ('{bid}')"))
        .await
        .unwrap();
    let status = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(status[0].get("status"), Some("confirmed"));

    client
        .batch_execute(&format!("INSERT INTO cancellations (booking_id) VALUES ('{bid}')"))
        .await
        .unwrap();
    assert_eq!(disabled_dates(&client, pid).await, "[]");
    book(&client, pid, "2025-01-11", "2025-01-13").await.unwrap();

    // The cancelled record is kept.
    let all = rows(&client, &format!("SELECT * FROM bookings WHERE property_id = '{pid}'")).await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn free_windows_between_stays() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;
    book(&client, pid, "2025-01-05", "2025-01-08").await.unwrap();

    let free = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE property_id = '{pid}' \
             AND check_in >= '2025-01-01' AND check_out <= '2025-01-15'"
        ),
    )
    .await;
    let windows: Vec<(String, String)> = free
        .iter()
        .map(|r| (r.get("check_in").unwrap().into(), r.get("check_out").unwrap().into()))
        .collect();
    assert_eq!(
        windows,
        vec![
            ("2025-01-01".to_string(), "2025-01-05".to_string()),
            ("2025-01-08".to_string(), "2025-01-15".to_string()),
        ]
    );
}

// ── Concurrency ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clients_one_winner() {
    let addr = start_default_server().await;
    let setup = connect(addr).await;
    let pid = list_property(&setup).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            book(&client, pid, "2025-03-07", "2025-03-09").await
        }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert_eq!(sqlstate(&e), "23P01"),
        }
    }
    assert_eq!(wins, 1);
}

// ── Extended protocol ────────────────────────────────────────

#[tokio::test]
async fn extended_query_params() {
    let addr = start_default_server().await;
    let client = connect(addr).await;
    let pid = list_property(&client).await;

    let inserted = client
        .execute(
            "INSERT INTO bookings (id, property_id, guest_id, check_in, check_out, guests) \
             VALUES ($1, $2, $3, $4, $5, 2)",
            &[
                &Ulid::new().to_string(),
                &pid.to_string(),
                &Ulid::new().to_string(),
                &"2025-02-01",
                &"2025-02-03",
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = client
        .query(
            "SELECT * FROM disabled_dates WHERE property_id = $1",
            &[&pid.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let dates: String = rows[0].get("dates");
    assert_eq!(dates, r#"["2025-02-01","2025-02-02","2025-02-03"]"#);
}

// ── Authentication ───────────────────────────────────────────

#[tokio::test]
async fn wrong_password_refused() {
    let addr = start_default_server().await;
    assert!(try_connect(addr, "staybnb", "nope").await.is_err());
}

#[tokio::test]
async fn user_table_logins() {
    let table = UserTable::parse("host:h1,guest:g1").unwrap();
    let addr = start_test_server(Arc::new(table)).await;

    assert!(try_connect(addr, "host", "h1").await.is_ok());
    assert!(try_connect(addr, "guest", "h1").await.is_err());
    assert!(try_connect(addr, "stranger", "h1").await.is_err());
}
