// ./api/src/main.rs
mod config;

use axum::{
    Json,
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response}, // Use JsonResponse for clarity
    routing::{delete, get, post},
};
use chrono::NaiveDate;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Application layer: stores, mirrored state, DTOs
use application::{
    AgendaResponse, AppState, ApplicationError, AppointmentRequest, AppointmentStore,
    AttachPhotosRequest, KeyValueStorage, PatientRequest, PatientSearchQuery, PatientStore,
};
use domain::RecordId;
// Storage implementations
use infrastructure::{FileStorage, InMemoryStorage};

use crate::config::{Config, StorageBackend};

/// Handler state: the application-state object, shared behind a lock.
#[derive(Clone)]
struct ApiState {
    app: Arc<RwLock<AppState>>,
}

impl ApiState {
    async fn patient_store(&self) -> Arc<PatientStore> {
        self.app.read().await.patient_store().clone()
    }

    async fn appointment_store(&self) -> Arc<AppointmentStore> {
        self.app.read().await.appointment_store().clone()
    }
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    let config = Config::from_env();

    // --- Dependency Injection ---
    // 1. Create the storage backend
    let storage: Arc<dyn KeyValueStorage> = match config.storage {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; records are lost on exit.");
            Arc::new(InMemoryStorage::new())
        }
        StorageBackend::File => match FileStorage::open(config.data_dir.clone()).await {
            Ok(storage) => {
                info!(data_dir = %storage.root().display(), "File storage initialized.");
                Arc::new(storage)
            }
            Err(e) => {
                error!("Failed to open data directory: {}", e);
                std::process::exit(1);
            }
        },
    };

    // 2. Create the stores and the application state
    let patient_store = Arc::new(PatientStore::new(storage.clone()));
    let appointment_store = Arc::new(AppointmentStore::new(storage, config.utc_offset));
    let mut app_state = AppState::new(patient_store, appointment_store);
    if let Err(e) = app_state.refresh_all().await {
        // Start anyway; the mirror fills in on the next successful reload.
        warn!("Initial load of records failed: {}", e);
    }
    info!(
        patients = app_state.patients().len(),
        appointments = app_state.appointments().len(),
        today = app_state.today_appointments_count(),
        "Application state loaded."
    );

    let app = build_router(ApiState {
        app: Arc::new(RwLock::new(app_state)),
    });
    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::new(config.bind_addr, config.port);
    info!("Server starting on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

// --- API Router Definition ---
fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Patient Endpoints
        .route("/patients", get(list_patients_handler).post(create_patient_handler))
        .route(
            "/patients/:id",
            get(get_patient_handler)
                .put(update_patient_handler)
                .delete(delete_patient_handler),
        )
        .route("/patients/:id/photos", post(attach_photos_handler))
        .route("/patients/:id/photos/:index", delete(remove_photo_handler))
        // Appointment Endpoints
        .route(
            "/appointments",
            get(list_appointments_handler).post(create_appointment_handler),
        )
        .route(
            "/appointments/:id",
            get(get_appointment_handler)
                .put(update_appointment_handler)
                .delete(delete_appointment_handler),
        )
        // Agenda Endpoints
        .route("/agenda/today", get(today_agenda_handler))
        .route("/agenda/day/:date", get(day_agenda_handler))
        .with_state(state)
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, "OK")
}

// --- Patient Handlers ---

/// GET /patients?q=... (search when `q` is present, full list otherwise).
async fn list_patients_handler(
    State(state): State<ApiState>,
    Query(query): Query<PatientSearchQuery>,
) -> Response {
    let store = state.patient_store().await;
    let result = match query.q.as_deref() {
        Some(q) => {
            info!(query = %q, "Received patient search request");
            store.search(q).await
        }
        None => {
            info!("Received request to list patients");
            store.get_all().await
        }
    };
    match result {
        Ok(patients) => (StatusCode::OK, JsonResponse(patients)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// POST /patients
async fn create_patient_handler(
    State(state): State<ApiState>,
    Json(payload): Json<PatientRequest>,
) -> Response {
    info!(name = %payload.name, "Received request to create patient");
    let patient = match payload.into_new_patient() {
        Ok(patient) => patient,
        Err(e) => return map_application_error_to_response(e),
    };
    match state.app.write().await.add_patient(patient.clone()).await {
        Ok(()) => {
            info!(patient_id = %patient.id(), "Patient created via handler");
            (StatusCode::CREATED, JsonResponse(patient)).into_response()
        }
        Err(e) => map_application_error_to_response(e),
    }
}

/// GET /patients/:id
async fn get_patient_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = RecordId::from(id);
    match state.patient_store().await.get_by_id(&id).await {
        Ok(Some(patient)) => (StatusCode::OK, JsonResponse(patient)).into_response(),
        Ok(None) => not_found_response("Patient", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

/// PUT /patients/:id (id, registration date and photos are kept).
async fn update_patient_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(payload): Json<PatientRequest>,
) -> Response {
    let id = RecordId::from(id);
    info!(patient_id = %id, "Received request to update patient");
    let result = state
        .app
        .write()
        .await
        .edit_patient(&id, |existing| payload.apply_to(existing))
        .await;
    match result {
        Ok(Some(edited)) => (StatusCode::OK, JsonResponse(edited)).into_response(),
        Ok(None) => not_found_response("Patient", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

/// DELETE /patients/:id
async fn delete_patient_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = RecordId::from(id);
    info!(patient_id = %id, "Received request to delete patient");
    match state.app.write().await.delete_patient(&id).await {
        Ok(true) => (StatusCode::NO_CONTENT, "").into_response(),
        Ok(false) => not_found_response("Patient", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

/// POST /patients/:id/photos
async fn attach_photos_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(payload): Json<AttachPhotosRequest>,
) -> Response {
    let id = RecordId::from(id);
    info!(patient_id = %id, count = payload.photos.len(), "Received request to attach photos");
    if payload.photos.is_empty() {
        return map_application_error_to_response(ApplicationError::InvalidInput(
            "At least one photo reference is required".to_string(),
        ));
    }
    let mut app = state.app.write().await;
    let result = app.patient_store().add_photos(&id, payload.photos).await;
    respond_with_edited_patient(&mut app, &id, result).await
}

/// DELETE /patients/:id/photos/:index
async fn remove_photo_handler(
    State(state): State<ApiState>,
    Path((id, index)): Path<(String, usize)>,
) -> Response {
    let id = RecordId::from(id);
    info!(patient_id = %id, index, "Received request to remove photo");
    let mut app = state.app.write().await;
    let result = app.patient_store().remove_photo(&id, index).await;
    respond_with_edited_patient(&mut app, &id, result).await
}

async fn respond_with_edited_patient(
    app: &mut AppState,
    id: &RecordId,
    result: Result<Option<domain::Patient>, ApplicationError>,
) -> Response {
    match result {
        Ok(Some(patient)) => {
            if let Err(e) = app.refresh_patients().await {
                warn!("Photo change saved but patient list not refreshed: {}", e);
            }
            (StatusCode::OK, JsonResponse(patient)).into_response()
        }
        Ok(None) => not_found_response("Patient", id),
        Err(e) => map_application_error_to_response(e),
    }
}

// --- Appointment Handlers ---

/// GET /appointments
async fn list_appointments_handler(State(state): State<ApiState>) -> Response {
    info!("Received request to list appointments");
    match state.appointment_store().await.get_all().await {
        Ok(appointments) => (StatusCode::OK, JsonResponse(appointments)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// POST /appointments
async fn create_appointment_handler(
    State(state): State<ApiState>,
    Json(payload): Json<AppointmentRequest>,
) -> Response {
    info!(patient_name = %payload.patient_name, time = %payload.time, "Received request to create appointment");
    let appointment = match payload.into_new_appointment() {
        Ok(appointment) => appointment,
        Err(e) => return map_application_error_to_response(e),
    };
    match state.app.write().await.add_appointment(appointment.clone()).await {
        Ok(()) => (StatusCode::CREATED, JsonResponse(appointment)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// GET /appointments/:id
async fn get_appointment_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let id = RecordId::from(id);
    match state.appointment_store().await.get_by_id(&id).await {
        Ok(Some(appointment)) => (StatusCode::OK, JsonResponse(appointment)).into_response(),
        Ok(None) => not_found_response("Appointment", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

/// PUT /appointments/:id
async fn update_appointment_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(payload): Json<AppointmentRequest>,
) -> Response {
    let id = RecordId::from(id);
    info!(appointment_id = %id, "Received request to update appointment");
    let result = state
        .app
        .write()
        .await
        .edit_appointment(&id, |existing| payload.apply_to(existing))
        .await;
    match result {
        Ok(Some(edited)) => (StatusCode::OK, JsonResponse(edited)).into_response(),
        Ok(None) => not_found_response("Appointment", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

/// DELETE /appointments/:id
async fn delete_appointment_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let id = RecordId::from(id);
    info!(appointment_id = %id, "Received request to delete appointment");
    match state.app.write().await.delete_appointment(&id).await {
        Ok(true) => (StatusCode::NO_CONTENT, "").into_response(),
        Ok(false) => not_found_response("Appointment", &id),
        Err(e) => map_application_error_to_response(e),
    }
}

// --- Agenda Handlers ---

/// GET /agenda/today (reloads the mirrored state first).
async fn today_agenda_handler(State(state): State<ApiState>) -> Response {
    let mut app = state.app.write().await;
    if let Err(e) = app.refresh_appointments().await {
        error!("Failed to reload today's agenda: {}", e);
        return map_application_error_to_response(e);
    }
    let response = AgendaResponse {
        date: app.appointment_store().today(),
        count: app.today_appointments_count(),
        appointments: app.today_appointments().to_vec(),
    };
    (StatusCode::OK, JsonResponse(response)).into_response()
}

/// GET /agenda/day/:date (`YYYY-MM-DD`).
async fn day_agenda_handler(
    State(state): State<ApiState>,
    Path(date): Path<NaiveDate>,
) -> Response {
    info!(%date, "Received request for day agenda");
    match state.appointment_store().await.get_for_date(date).await {
        Ok(appointments) => {
            let response = AgendaResponse {
                date,
                count: appointments.len(),
                appointments,
            };
            (StatusCode::OK, JsonResponse(response)).into_response()
        }
        Err(e) => map_application_error_to_response(e),
    }
}

fn not_found_response(kind: &str, id: &RecordId) -> Response {
    warn!(%id, "{} not found", kind);
    (StatusCode::NOT_FOUND, format!("{} '{}' not found", kind, id)).into_response()
}

/// Helper function to map ApplicationError enum to HTTP status codes and response body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let (status, body) = match err {
        ApplicationError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        ApplicationError::DomainError(domain_err) => {
            warn!("Domain validation failed: {}", domain_err);
            (StatusCode::BAD_REQUEST, domain_err.to_string())
        }
        ApplicationError::OperationFailed { operation, source } => {
            // Storage detail goes to the log only.
            error!(operation, "Storage failure: {}", source);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to {}", operation),
            )
        }
    };
    (status, body).into_response() // Convert tuple to Response
}
