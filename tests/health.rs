use babyshop_api::routes::health::health_check;

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let resp = health_check().await;
    assert_eq!(resp.0.message, "Health check");
    assert_eq!(resp.0.data.unwrap().status, "ok");
}
