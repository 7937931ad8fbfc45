use std::sync::Arc;

use bq_config::OAuthCredentials;
use bq_telemetry::init_test_tracing;
use bq_writer::bigquery::{BigQueryClient, OAuthTokenProvider};
use bq_writer::error::ErrorKind;
use bq_writer::schema::{FieldSchema, FieldType};
use bq_writer::test_utils::{scratch_dir, write_file};
use bq_writer::warehouse::{JobState, LoadJob, LoadRequest, Warehouse};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT: &str = "test-project";

fn client(server: &MockServer) -> BigQueryClient {
    let credentials = OAuthCredentials {
        access_token: SecretString::new("initial-token".to_owned()),
        refresh_token: SecretString::new("refresh-token".to_owned()),
        client_id: "client-id".to_owned(),
        client_secret: SecretString::new("client-secret".to_owned()),
        token_uri: format!("{}/token", server.uri()),
    };
    let http = reqwest::Client::new();
    let token_provider = Arc::new(OAuthTokenProvider::new(http.clone(), credentials));

    BigQueryClient::new(http, token_provider, PROJECT, Some("EU".to_owned())).with_base_urls(
        format!("{}/bigquery/v2", server.uri()),
        format!("{}/upload/bigquery/v2", server.uri()),
    )
}

#[tokio::test]
async fn lists_projects_across_pages() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": [{"id": "second", "projectReference": {"projectId": "second"}}]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "projects": [{
                "id": "first",
                "friendlyName": "First",
                "projectReference": {"projectId": "first"}
            }],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;

    let projects = client(&server).list_projects().await.unwrap();

    let ids = projects.iter().map(|project| project.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["first", "second"]);
    assert_eq!(projects[0].friendly_name.as_deref(), Some("First"));
}

#[tokio::test]
async fn missing_table_is_none() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/bigquery/v2/projects/{PROJECT}/datasets/dataset/tables/missing"
        )))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "code": 404,
                "message": "Not found: Table test-project:dataset.missing",
                "errors": [{"reason": "notFound", "message": "Not found: Table test-project:dataset.missing"}]
            }
        })))
        .mount(&server)
        .await;

    let table = client(&server).get_table("dataset", "missing").await.unwrap();

    assert!(table.is_none());
}

#[tokio::test]
async fn reads_live_table_columns() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/bigquery/v2/projects/{PROJECT}/datasets/dataset/tables/people"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tableReference": {"projectId": PROJECT, "datasetId": "dataset", "tableId": "people"},
            "schema": {"fields": [
                {"name": "id", "type": "INTEGER", "mode": "NULLABLE"},
                {"name": "name", "type": "STRING", "mode": "NULLABLE"}
            ]},
            "numRows": "2"
        })))
        .mount(&server)
        .await;

    let table = client(&server)
        .get_table("dataset", "people")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(table.column_names, vec!["id".to_owned(), "name".to_owned()]);
    assert_eq!(table.num_rows, Some(2));
}

#[tokio::test]
async fn rejected_token_is_refreshed_once() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects"))
        .and(header("authorization", "Bearer initial-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"projects": []})))
        .expect(1)
        .mount(&server)
        .await;

    let projects = client(&server).list_projects().await.unwrap();

    assert!(projects.is_empty());
}

#[tokio::test]
async fn failed_refresh_is_authentication_error() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let err = client(&server).list_projects().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    assert!(
        err.message()
            .starts_with("Cannot connect to BigQuery. Check your access token or refresh token."),
        "{}",
        err.message()
    );
}

#[tokio::test]
async fn server_errors_are_transient() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/bigquery/v2/projects/{PROJECT}/datasets/dataset")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server).get_dataset("dataset").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationUnavailable);
    assert!(err.kind().is_transient());
}

#[tokio::test]
async fn creates_dataset_in_location() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bigquery/v2/projects/{PROJECT}/datasets")))
        .and(body_partial_json(json!({
            "datasetReference": {"projectId": PROJECT, "datasetId": "dataset"},
            "location": "EU"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datasetReference": {"projectId": PROJECT, "datasetId": "dataset"},
            "location": "EU"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dataset = client(&server).create_dataset("dataset").await.unwrap();

    assert_eq!(dataset.dataset_id, "dataset");
    assert_eq!(dataset.location.as_deref(), Some("EU"));
}

#[tokio::test]
async fn load_is_uploaded_through_resumable_session() {
    init_test_tracing();
    let server = MockServer::start().await;
    let session = format!("{}/upload-session/abc", server.uri());
    Mock::given(method("POST"))
        .and(path(format!("/upload/bigquery/v2/projects/{PROJECT}/jobs")))
        .and(query_param("uploadType", "resumable"))
        .and(body_partial_json(json!({
            "configuration": {"load": {
                "destinationTable": {"projectId": PROJECT, "datasetId": "dataset", "tableId": "people"},
                "sourceFormat": "CSV",
                "skipLeadingRows": 1,
                "allowQuotedNewlines": true,
                "writeDisposition": "WRITE_APPEND",
                "createDisposition": "CREATE_NEVER"
            }}
        })))
        .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-session/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobReference": {"projectId": PROJECT, "jobId": "job-1", "location": "EU"},
            "status": {"state": "RUNNING"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = scratch_dir("client");
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");
    let schema = vec![
        FieldSchema::new("id", FieldType::Integer),
        FieldSchema::new("name", FieldType::String),
    ];
    let request = LoadRequest::csv("dataset", "people", &csv, schema, 1);

    let job = client(&server).submit_load(&request).await.unwrap();

    assert_eq!(job.job_id, "job-1");
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.location.as_deref(), Some("EU"));

    let uploaded = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|request| request.method.as_str() == "PUT")
        .unwrap();
    assert_eq!(uploaded.body, b"id,name\n1,alice\n");
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn finished_job_carries_row_errors() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/bigquery/v2/projects/{PROJECT}/jobs/job-1")))
        .and(query_param("location", "EU"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobReference": {"projectId": PROJECT, "jobId": "job-1", "location": "EU"},
            "status": {
                "state": "DONE",
                "errorResult": {
                    "reason": "invalid",
                    "message": "Error while reading data, error message: CSV table encountered too many errors, giving up. Rows: 1; errors: 1."
                },
                "errors": [
                    {
                        "reason": "invalid",
                        "message": "Error while reading data, error message: CSV table encountered too many errors, giving up. Rows: 1; errors: 1."
                    },
                    {
                        "reason": "invalid",
                        "message": "Error while reading data, error message: Too many values in row starting at position: 8."
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let job = LoadJob {
        job_id: "job-1".to_owned(),
        location: Some("EU".to_owned()),
        state: JobState::Running,
        error: None,
    };
    let job = client(&server).refresh_job(&job).await.unwrap();

    assert!(job.is_done());
    assert_eq!(
        job.error.unwrap().diagnostic(),
        "Error while reading data, error message: Too many values in row starting at position: 8."
    );
}
