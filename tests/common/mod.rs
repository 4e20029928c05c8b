use mockproxy::prelude::*;

/// Builds and starts a proxy on a free port, with test logging wired up.
pub async fn start_proxy() -> MockProxy {
    let _ = env_logger::builder().is_test(true).try_init();
    let proxy = MockProxyBuilder::new()
        .build()
        .expect("default proxy must build");
    proxy.start().await.expect("proxy must start");
    proxy
}

#[allow(dead_code)]
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client must build")
}
