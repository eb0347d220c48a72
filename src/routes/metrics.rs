use actix_web::web;
use actix_web::HttpResponse;
use metrics_exporter_prometheus::PrometheusHandle;

pub async fn metrics_scrape(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render())
}
