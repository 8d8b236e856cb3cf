use import_server::routes::imports::{UploadResponse, upload_spreadsheet};
use import_server::session::SESSION_HEADER;
use import_server::test_support::{TestRocketBuilder, temp_import_config};
use rocket::http::{Header, Status};
use rocket::local::blocking::Client;
use rocket::routes;
use tempfile::TempDir;

fn upload_client() -> (Client, TempDir) {
    let (config, upload_dir) = temp_import_config();
    let client = TestRocketBuilder::new()
        .manage_import_config(config)
        .mount_api_routes(routes![upload_spreadsheet])
        .blocking_client();
    (client, upload_dir)
}

/// Names of everything staged in the upload directory, sorted.
fn staged_files(upload_dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(upload_dir.path())
        .expect("upload dir readable")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

#[test]
fn upload_stages_csv_and_reports_size() {
    let (client, upload_dir) = upload_client();

    let body = "Name,Amount\nAnn,10.50\nBob,20.00\n";
    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "alpha"))
        .body(body)
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: UploadResponse = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.file_name, "donors.csv");
    assert_eq!(payload.size_bytes, body.len() as u64);

    let staged = staged_files(&upload_dir);
    assert_eq!(staged.len(), 1, "one staged file: {staged:?}");
    assert!(
        staged[0].starts_with("alpha_") && staged[0].ends_with("_donors.csv"),
        "unexpected staged name: {}",
        staged[0]
    );
    let on_disk = std::fs::read_to_string(upload_dir.path().join(&staged[0]))
        .expect("staged file readable");
    assert_eq!(on_disk, body);
}

#[test]
fn upload_rejects_unsupported_extension() {
    let (client, upload_dir) = upload_client();

    let response = client
        .post("/api/v1/imports/upload?filename=notes.txt")
        .header(Header::new(SESSION_HEADER, "alpha"))
        .body("just some text")
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);

    // The rejected file must not linger on disk.
    assert!(staged_files(&upload_dir).is_empty());
}

#[test]
fn upload_requires_session_header() {
    let (client, _upload_dir) = upload_client();

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .body("Name\nAnn\n")
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn upload_rejects_blank_session_header() {
    let (client, _upload_dir) = upload_client();

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "   "))
        .body("Name\nAnn\n")
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn second_upload_replaces_the_first() {
    let (client, upload_dir) = upload_client();

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "alpha"))
        .body("Name,Amount\nAnn,10.50\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .post("/api/v1/imports/upload?filename=gifts.csv")
        .header(Header::new(SESSION_HEADER, "alpha"))
        .body("Item,Count\nPen,3\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    // Only the replacement remains staged.
    let staged = staged_files(&upload_dir);
    assert_eq!(staged.len(), 1, "one staged file: {staged:?}");
    assert!(
        staged[0].ends_with("_gifts.csv"),
        "unexpected staged name: {}",
        staged[0]
    );
}

#[test]
fn sessions_do_not_share_staged_files() {
    let (client, upload_dir) = upload_client();

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "alpha"))
        .body("Name\nAnn\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "beta"))
        .body("Name\nBob\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let staged = staged_files(&upload_dir);
    assert_eq!(staged.len(), 2, "both sessions staged: {staged:?}");
    let alpha = staged
        .iter()
        .find(|name| name.starts_with("alpha_"))
        .expect("alpha upload staged");
    let beta = staged
        .iter()
        .find(|name| name.starts_with("beta_"))
        .expect("beta upload staged");

    let alpha = std::fs::read_to_string(upload_dir.path().join(alpha))
        .expect("alpha upload readable");
    let beta =
        std::fs::read_to_string(upload_dir.path().join(beta)).expect("beta upload readable");
    assert_eq!(alpha, "Name\nAnn\n");
    assert_eq!(beta, "Name\nBob\n");
}

#[test]
fn sessions_sanitizing_alike_keep_separate_staged_files() {
    let (client, upload_dir) = upload_client();

    // "a b" and "ab" sanitize to the same file-name prefix.
    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "a b"))
        .body("Name\nAnn\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .post("/api/v1/imports/upload?filename=donors.csv")
        .header(Header::new(SESSION_HEADER, "ab"))
        .body("Name\nBob\n")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let staged = staged_files(&upload_dir);
    assert_eq!(staged.len(), 2, "each session keeps its file: {staged:?}");
    let contents: Vec<String> = staged
        .iter()
        .map(|name| {
            std::fs::read_to_string(upload_dir.path().join(name)).expect("staged file readable")
        })
        .collect();
    assert!(contents.contains(&"Name\nAnn\n".to_string()));
    assert!(contents.contains(&"Name\nBob\n".to_string()));
}
