use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use dotenv::dotenv;
use minijinja::{Environment, path_loader};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

mod backup;
mod cli;
mod config;
mod db;
mod logging;

use backup::components::{FILE_COMPONENTS, RESTORE_DEFAULT_COMPONENTS};
use backup::db_env::LiveDatasourceFile;
use backup::monitor::JobStatus;
use backup::scheduler::{CrontabStore, RunnerCommand, Scheduler};
use backup::service::{BackupService, BackupSetOption, JobStarted, Notice, ScheduledRun};
use backup::storage::b2_storage::B2BucketProbe;
use backup::storage::local_storage::LocalUploadStore;
use backup::supervisor::ProcessSupervisor;
use backup::BackupError;
use cli::Command;
use config::AppConfig;
use db::{SettingsForm, SqliteSettingsRepository};

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

// Define a struct to hold our application state
struct AppState {
    templates: Environment<'static>,
    service: BackupService,
    // Upload bodies are streamed here, next to where the store keeps them
    upload_staging: PathBuf,
}

// Errors leave handlers as `{ started: false, ok: false, message }`
struct ApiError(BackupError);

#[derive(Serialize)]
struct ErrorBody {
    started: bool,
    ok: bool,
    message: String,
}

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BackupError::ConfigurationIncomplete
            | BackupError::UploadInvalid(_)
            | BackupError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BackupError::JobAlreadyRunning => StatusCode::CONFLICT,
            BackupError::Storage(_) | BackupError::EngineFailure { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = ErrorBody {
            started: false,
            ok: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// Handler for the index route
async fn index_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Html<String>, (StatusCode, String)> {
    let overview = state
        .service
        .overview()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let rendered = state
        .templates
        .get_template("index.html")
        .and_then(|template| {
            template.render(minijinja::context! {
                overview => overview,
                file_components => FILE_COMPONENTS,
                restore_default_components => RESTORE_DEFAULT_COMPONENTS,
                weekdays => WEEKDAYS,
            })
        })
        .map_err(|e| {
            error!(error = %e, "failed to render index");
            (StatusCode::INTERNAL_SERVER_ERROR, String::from("Failed to render page"))
        })?;

    Ok(Html(rendered))
}

// Handler to save the settings record
async fn save_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(form): Json<SettingsForm>,
) -> Result<Json<Notice>, ApiError> {
    Ok(Json(state.service.save_settings(form).await?))
}

#[derive(Deserialize)]
struct RunBackupRequest {
    backup_type: String,
    #[serde(default)]
    backup_components: Vec<String>,
}

async fn run_backup_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunBackupRequest>,
) -> Result<Json<JobStarted>, ApiError> {
    let started = state
        .service
        .run_backup(&request.backup_type, &request.backup_components)
        .await?;
    Ok(Json(started))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<JobStatus> {
    Json(state.service.status().await)
}

async fn validate_handler(State(state): State<Arc<AppState>>) -> Result<Json<Notice>, ApiError> {
    match state.service.validate().await {
        Ok(notice) => Ok(Json(notice)),
        Err(BackupError::EngineFailure { excerpt, .. }) => Err(ApiError(BackupError::Validation(
            format!("Validation failed: {}", excerpt),
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn backup_sets_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupSetOption>>, ApiError> {
    Ok(Json(state.service.backup_sets().await?))
}

#[derive(Deserialize)]
struct RestoreSetRequest {
    #[serde(default)]
    snapshot_set: String,
    #[serde(default)]
    restore_components: Vec<String>,
}

async fn restore_set_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreSetRequest>,
) -> Result<Json<JobStarted>, ApiError> {
    let started = state
        .service
        .restore_set(&request.snapshot_set, &request.restore_components)
        .await?;
    Ok(Json(started))
}

#[derive(Deserialize)]
struct RestoreFullRequest {
    #[serde(default)]
    snapshot_set: Option<String>,
    #[serde(default)]
    include_env_files: bool,
}

async fn restore_full_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreFullRequest>,
) -> Result<Json<JobStarted>, ApiError> {
    let started = state
        .service
        .restore_full(request.snapshot_set.as_deref(), request.include_env_files)
        .await?;
    Ok(Json(started))
}

// Multipart body of the upload restores; the staged file is removed on drop
#[derive(Default)]
struct UploadForm {
    file_name: Option<String>,
    staged: Option<TempPath>,
    size: u64,
    target_dir: String,
}

async fn read_upload(
    mut multipart: Multipart,
    staging_dir: &Path,
    missing: &str,
) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| BackupError::UploadInvalid(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "backup_file" => {
                form.file_name = field.file_name().map(str::to_string);

                let (file, path) = NamedTempFile::new_in(staging_dir)
                    .map_err(BackupError::from)?
                    .into_parts();
                let mut file = tokio::fs::File::from_std(file);
                let mut size = 0u64;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| BackupError::UploadInvalid(e.to_string()))?
                {
                    file.write_all(&chunk).await.map_err(BackupError::from)?;
                    size += chunk.len() as u64;
                }
                file.flush().await.map_err(BackupError::from)?;

                form.staged = Some(path);
                form.size = size;
            }
            "target_dir" => {
                form.target_dir = field
                    .text()
                    .await
                    .map_err(|e| BackupError::UploadInvalid(e.to_string()))?;
            }
            _ => {}
        }
    }

    if form.file_name.as_deref().is_none_or(|n| n.trim().is_empty()) || form.size == 0 {
        return Err(BackupError::UploadInvalid(missing.to_string()).into());
    }
    Ok(form)
}

async fn restore_db_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<JobStarted>, ApiError> {
    let upload = read_upload(
        multipart,
        &state.upload_staging,
        "Please upload a valid DB backup file (.sql or .sql.gz).",
    )
    .await?;
    let (Some(file_name), Some(staged)) = (&upload.file_name, &upload.staged) else {
        return Err(BackupError::UploadInvalid("missing upload".to_string()).into());
    };

    let started = state.service.restore_db_file(file_name, staged).await?;
    Ok(Json(started))
}

async fn restore_files_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<JobStarted>, ApiError> {
    let upload = read_upload(
        multipart,
        &state.upload_staging,
        "Please upload a valid files archive (.tar.gz, .tgz, or .zip).",
    )
    .await?;
    let (Some(file_name), Some(staged)) = (&upload.file_name, &upload.staged) else {
        return Err(BackupError::UploadInvalid("missing upload".to_string()).into());
    };

    let started = state
        .service
        .restore_files_file(file_name, staged, &upload.target_dir)
        .await?;
    Ok(Json(started))
}

// Wire the service to the real settings store, engine, crontab and bucket
async fn build_service(config: &AppConfig, config_path: &Path) -> backup::Result<BackupService> {
    let pool = db::init_db(&config.settings_database_url).await?;
    info!("Settings database initialized successfully");

    let runner = RunnerCommand {
        app_root: config.app_root.clone(),
        executable: std::env::current_exe()?,
        config_path: config_path
            .is_file()
            .then(|| std::fs::canonicalize(config_path))
            .transpose()?,
        log_path: config.backup_log_path(),
        env: config.scheduled_env(),
    };

    let mut service = BackupService::new(
        config.clone(),
        Arc::new(SqliteSettingsRepository::new(pool)),
        Arc::new(ProcessSupervisor::new(config)),
        Scheduler::new(Arc::new(CrontabStore::new()), runner),
        Arc::new(LocalUploadStore::new(config)),
    )
    .with_bucket_probe(Arc::new(B2BucketProbe::new()));

    if let Some(path) = &config.datasource.live_config {
        let path = if path.is_relative() {
            config.app_root.join(path)
        } else {
            path.clone()
        };
        service = service.with_live_connection(Arc::new(LiveDatasourceFile::new(path)));
    }

    Ok(service)
}

async fn serve(config: AppConfig, service: BackupService) -> ExitCode {
    // Set up the template environment
    let mut env = Environment::new();
    env.set_loader(path_loader("templates"));

    // Create the application state
    let state = Arc::new(AppState {
        templates: env,
        service,
        upload_staging: config.uploads_dir(),
    });

    // Set up the routes
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/settings", post(save_settings_handler))
        .route("/backups/run", post(run_backup_handler))
        .route("/backups/status", get(status_handler))
        .route("/backups/validate", post(validate_handler))
        .route("/backups/sets", get(backup_sets_handler))
        .route("/backups/restore/set", post(restore_set_handler))
        .route("/backups/restore/full", post(restore_full_handler))
        .route("/backups/restore/db", post(restore_db_handler))
        .route("/backups/restore/files", post(restore_files_handler))
        .layer(DefaultBodyLimit::max(config.upload_limit_bytes))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.bind_addr, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!("Server starting on http://{}", config.bind_addr);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server stopped");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_scheduled(service: BackupService) -> ExitCode {
    match service.run_scheduled().await {
        Ok(ScheduledRun::Disabled) => {
            println!("Backup schedule is disabled. Nothing to run.");
            ExitCode::SUCCESS
        }
        Ok(ScheduledRun::Completed(output)) => {
            for line in output.output.lines() {
                println!("{}", line);
            }
            ExitCode::from(u8::try_from(output.exit_code).unwrap_or(1))
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// Absolute paths, a salt and the log/work directories before anything runs
fn prepare(config: &mut AppConfig) -> backup::Result<()> {
    config.resolve_paths()?;
    config.ensure_security_salt()?;
    config.ensure_dirs()?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();

    let args = cli::parse();
    logging::init_logging(args.log_level);

    let config_path: PathBuf = args.config_path();
    let mut config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = prepare(&mut config) {
        error!(error = %e, "failed to prepare application directories");
        return ExitCode::FAILURE;
    }

    let service = match build_service(&config, &config_path).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "failed to initialize backup service");
            return ExitCode::FAILURE;
        }
    };

    match args.command() {
        Command::Serve => serve(config, service).await,
        Command::RunScheduled => run_scheduled(service).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use tempfile::tempdir;

    async fn multipart(body: &str) -> Multipart {
        let request = Request::builder()
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XYZ")
            .body(Body::from(body.replace('\n', "\r\n")))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    fn upload_body(file_name: &str, contents: &str) -> String {
        format!(
            "--XYZ\nContent-Disposition: form-data; name=\"target_dir\"\n\n/srv/restore\n\
             --XYZ\nContent-Disposition: form-data; name=\"backup_file\"; filename=\"{}\"\n\
             Content-Type: application/octet-stream\n\n{}\n--XYZ--\n",
            file_name, contents
        )
    }

    #[tokio::test]
    async fn test_read_upload_streams_file_to_staging() {
        let dir = tempdir().unwrap();
        let body = multipart(&upload_body("site.tgz", "archive-bytes")).await;

        let Ok(form) = read_upload(body, dir.path(), "missing").await else {
            panic!("upload rejected");
        };
        assert_eq!(form.file_name.as_deref(), Some("site.tgz"));
        assert_eq!(form.target_dir, "/srv/restore");
        assert_eq!(form.size, 13);

        let staged = form.staged.as_ref().unwrap();
        assert!(staged.starts_with(dir.path()));
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "archive-bytes");
    }

    #[tokio::test]
    async fn test_read_upload_rejects_empty_file_and_drops_staging() {
        let dir = tempdir().unwrap();
        let body = multipart(&upload_body("site.tgz", "")).await;

        match read_upload(body, dir.path(), "Please upload a file.").await {
            Err(ApiError(BackupError::UploadInvalid(message))) => {
                assert_eq!(message, "Please upload a file.")
            }
            _ => panic!("empty upload accepted"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
