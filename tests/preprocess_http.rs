use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use fitpulse::{preprocess_router, PipelineConfig};
use serde_json::Value as Json;
use tower::util::ServiceExt;

const SAMPLE: &str = "\
User_ID,Date,Hours_Slept,Water_Intake (Liters),Active_Minutes,Heart_Rate (bpm)
17,01/01/2024 10:00,7,2.0,40,60
17,01/01/2024 12:00,7,2.0,40,80
17,01/01/2024 13:00,7,2.0,40,200
17,01/01/2024 14:00,7,2.0,40,80
17,01/01/2024 15:00,7,2.0,40,80
17,01/01/2024 16:00,7,2.0,40,80
17,01/01/2024 17:00,7,2.0,40,80
17,01/01/2024 18:00,7,2.0,40,80
17,01/01/2024 19:00,7,2.0,40,80
17,01/01/2024 20:00,7,2.0,40,80
17,01/01/2024 21:00,7,2.0,40,80
";

fn app() -> Router {
    preprocess_router(PipelineConfig::default()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn preprocess_returns_summary_columns_and_typed_rows() {
    let (status, body) = send(app(), post("/pipeline/preprocess", SAMPLE)).await;
    assert_eq!(status, StatusCode::OK);

    let json: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(json["summary"]["total_records"], 11);
    assert_eq!(json["summary"]["users_found"], 1);
    assert_eq!(json["summary"]["final_row_count"], 12);
    assert_eq!(json["summary"]["resampling_frequency"], "hourly");
    assert_eq!(json["columns"][0], "User_ID");
    assert_eq!(json["columns"][1], "Date");

    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 12);
    assert_eq!(rows[0]["User_ID"], 17);
    assert_eq!(rows[1]["Date"], "2024-01-01T11:00:00Z");
    assert_eq!(rows[1]["Heart_Rate (bpm)"], 70.0);
    assert_eq!(json["anomalies"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn zscore_threshold_query_flags_spikes() {
    let (status, body) = send(
        app(),
        post("/pipeline/preprocess?zscore_threshold=3", SAMPLE),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json: Json = serde_json::from_str(&body).unwrap();
    let anomalies = json["anomalies"].as_array().unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0]["column"], "Heart_Rate (bpm)");
    assert_eq!(anomalies[0]["value"], 200.0);
    assert_eq!(anomalies[0]["grid_timestamp"], "2024-01-01T13:00:00Z");
}

#[tokio::test]
async fn csv_route_streams_back_the_resampled_table() {
    let response = app()
        .oneshot(post("/pipeline/preprocess.csv", SAMPLE))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/csv; charset=utf-8"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[0],
        "User_ID,Date,Hours_Slept,Water_Intake (Liters),Active_Minutes,Heart_Rate (bpm)"
    );
    assert_eq!(lines[2], "17,2024-01-01T11:00:00Z,7,2,40,70");
    assert_eq!(lines.len(), 13);
}

#[tokio::test]
async fn missing_declared_column_is_unprocessable() {
    let csv = "User_ID,Date,Hours_Slept\n1,01/01/2024 10:00,7\n";
    let (status, body) = send(app(), post("/pipeline/preprocess", csv)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let json: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "unprocessable");
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("Heart_Rate (bpm)"));
}

#[tokio::test]
async fn century_spanning_user_is_unprocessable() {
    let mut lines = SAMPLE.lines();
    let csv = format!(
        "{}\n17,01/01/1900 10:00,7,2.0,40,60\n{}\n",
        lines.next().unwrap(),
        lines.next().unwrap()
    );
    let (status, body) = send(app(), post("/pipeline/preprocess", &csv)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    let json: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "unprocessable");
    assert!(json["message"].as_str().unwrap().contains("limit is 100000"));
}

#[tokio::test]
async fn undecodable_csv_is_a_bad_request() {
    let mut csv = SAMPLE.lines().next().unwrap().as_bytes().to_vec();
    csv.push(b'\n');
    csv.extend_from_slice(b"1,01/01/2024 10:00,\xff\xfe,1,1,1\n");
    let request = Request::builder()
        .method("POST")
        .uri("/pipeline/preprocess.csv")
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(csv))
        .unwrap();
    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    let json: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "csv");
}

#[tokio::test]
async fn config_route_describes_the_active_schema() {
    let request = Request::builder()
        .uri("/pipeline/config")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(), request).await;
    assert_eq!(status, StatusCode::OK);

    let json: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(json["config"]["entity_column"], "User_ID");
    assert_eq!(json["config"]["date_format"], "day_first");
    assert_eq!(json["config"]["timezone"], "UTC");
    assert_eq!(json["schema_fingerprint"].as_str().map(str::len), Some(64));
    assert_eq!(json["columns"].as_array().map(Vec::len), Some(6));
}
