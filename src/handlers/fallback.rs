use crate::error::AppError;
use actix_web::HttpRequest;

/// Any route the internal server does not know.
pub async fn not_found(req: HttpRequest) -> Result<actix_web::HttpResponse, AppError> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}
