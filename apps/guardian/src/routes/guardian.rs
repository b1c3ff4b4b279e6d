//! Guardian endpoints.
//!
//! Thin adapters around `GuardianRegistry`. Every response uses the
//! `{data, error, code}` envelope; throttled failures carry the
//! remaining-trials snapshot in `data`.

use actix_web::{HttpRequest, HttpResponse, ResponseError, web};
use serde::{Deserialize, Serialize};

use crate::error::GuardianError;
use crate::registry::{
    GuardianRegistry, RegisteredUsersResponse, RegistrationRequest, SecurityModeRequest,
    SignMessageRequest, SignMessageResponse, SignMultipleTransactionsRequest,
    SignMultipleTransactionsResponse, SignTransactionRequest, SignTransactionResponse,
    VerificationRequest,
};

/// Success envelope.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub error: String,
    pub code: String,
}

fn ok<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse {
        data,
        error: String::new(),
        code: "successful".to_string(),
    })
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

/// JSON extractor config mapping body errors onto the error envelope.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| GuardianError::Deserialization(err.to_string()).into())
}

/// POST /guardian/register
#[tracing::instrument(skip(registry, request))]
pub async fn register(
    registry: web::Data<GuardianRegistry>,
    request: web::Json<RegistrationRequest>,
) -> HttpResponse {
    match registry.register_user(&request).await {
        Ok(response) => ok(response),
        Err(e) => {
            tracing::warn!(error = %e, "Registration failed");
            e.error_response()
        }
    }
}

/// POST /guardian/verify-code
#[tracing::instrument(skip(registry, req, request))]
pub async fn verify_code(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<VerificationRequest>,
) -> HttpResponse {
    match registry.verify_code(&client_ip(&req), &request).await {
        Ok(data) => ok(data),
        Err(e) => {
            tracing::debug!(error = %e, "Code verification failed");
            e.error_response()
        }
    }
}

/// POST /guardian/sign-transaction
#[tracing::instrument(skip(registry, req, request))]
pub async fn sign_transaction(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<SignTransactionRequest>,
) -> HttpResponse {
    match registry.sign_transaction(&client_ip(&req), &request).await {
        Ok((tx, _)) => ok(SignTransactionResponse { tx }),
        Err(e) => {
            tracing::debug!(error = %e, "Transaction signing failed");
            e.error_response()
        }
    }
}

/// POST /guardian/sign-multiple-transactions
#[tracing::instrument(skip(registry, req, request))]
pub async fn sign_multiple_transactions(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<SignMultipleTransactionsRequest>,
) -> HttpResponse {
    match registry
        .sign_multiple_transactions(&client_ip(&req), &request)
        .await
    {
        Ok((txs, _)) => ok(SignMultipleTransactionsResponse { txs }),
        Err(e) => {
            tracing::debug!(error = %e, "Batch signing failed");
            e.error_response()
        }
    }
}

/// POST /guardian/sign-message
#[tracing::instrument(skip(registry, req, request))]
pub async fn sign_message(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<SignMessageRequest>,
) -> HttpResponse {
    match registry.sign_message(&client_ip(&req), &request).await {
        Ok((signature, _)) => ok(SignMessageResponse {
            message: request.into_inner().message,
            signature,
        }),
        Err(e) => {
            tracing::debug!(error = %e, "Message signing failed");
            e.error_response()
        }
    }
}

/// POST /guardian/security-mode
#[tracing::instrument(skip(registry, req, request))]
pub async fn set_security_mode(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<SecurityModeRequest>,
) -> HttpResponse {
    match registry
        .set_security_mode_no_expire(&client_ip(&req), &request)
        .await
    {
        Ok(data) => ok(data),
        Err(e) => {
            tracing::debug!(error = %e, "Setting security mode failed");
            e.error_response()
        }
    }
}

/// POST /guardian/unset-security-mode
#[tracing::instrument(skip(registry, req, request))]
pub async fn unset_security_mode(
    registry: web::Data<GuardianRegistry>,
    req: HttpRequest,
    request: web::Json<SecurityModeRequest>,
) -> HttpResponse {
    match registry
        .unset_security_mode_no_expire(&client_ip(&req), &request)
        .await
    {
        Ok(data) => ok(data),
        Err(e) => {
            tracing::debug!(error = %e, "Unsetting security mode failed");
            e.error_response()
        }
    }
}

/// GET /guardian/registered-users
#[tracing::instrument(skip(registry))]
pub async fn registered_users(registry: web::Data<GuardianRegistry>) -> HttpResponse {
    match registry.registered_users() {
        Ok(count) => ok(RegisteredUsersResponse { count }),
        Err(e) => {
            tracing::error!(error = %e, "Counting registered users failed");
            e.error_response()
        }
    }
}

/// GET /guardian/config
#[tracing::instrument(skip(registry))]
pub async fn config(registry: web::Data<GuardianRegistry>) -> HttpResponse {
    ok(registry.tcs_config())
}

/// Configure guardian routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/guardian")
            .route("/register", web::post().to(register))
            .route("/verify-code", web::post().to(verify_code))
            .route("/sign-transaction", web::post().to(sign_transaction))
            .route(
                "/sign-multiple-transactions",
                web::post().to(sign_multiple_transactions),
            )
            .route("/sign-message", web::post().to(sign_message))
            .route("/security-mode", web::post().to(set_security_mode))
            .route("/unset-security-mode", web::post().to(unset_security_mode))
            .route("/registered-users", web::get().to(registered_users))
            .route("/config", web::get().to(config)),
    );
}
