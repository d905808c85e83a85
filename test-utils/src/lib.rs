//! `test-utils` is used for testing in both `viewrelay-lib` and `viewrelay-bin`.
//! This crate does not depend on `viewrelay-lib` or `viewrelay-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Serve a plain-text proxy list, one entry per line, under `/proxies.txt`
#[macro_export]
macro_rules! proxy_list_server {
    ($($entry:expr),* $(,)?) => {{
        let mock_server = wiremock::MockServer::start().await;
        let entries: Vec<String> = vec![$($entry.to_string()),*];
        let body: String = entries.iter().map(|entry| format!("{entry}\r\n")).collect();
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/proxies.txt"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// Build a `ProxyPool` holding `n` healthy proxies `10.0.0.1:8000`,
/// `10.0.0.1:8001`, ... with increasing latency, so the first one ranks best
#[macro_export]
macro_rules! healthy_pool {
    ($n:expr) => {
        $crate::healthy_pool!($n, PoolConfig::default())
    };
    ($n:expr, $config:expr) => {{
        let pool = ProxyPool::new($config);
        let candidates: Vec<ProxyCandidate> = (0..$n)
            .map(|i: u16| format!("10.0.0.1:{}", 8000 + i).parse().unwrap())
            .collect();
        pool.ingest(candidates.clone());
        for (i, candidate) in candidates.iter().enumerate() {
            let latency = std::time::Duration::from_millis(100 + 10 * i as u64);
            pool.apply_verdict(&Verdict::reachable(candidate.key(), latency));
        }
        pool.take_validation_queue();
        pool
    }};
}
