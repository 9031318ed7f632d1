use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::engine::AssessmentEngine;
use crate::routes::{
    get_assessment_handler, get_questions_handler, health_handler, json_error_handler,
    post_assessment_handler, query_error_handler, run_handler, start_assessment_handler,
    submit_handler,
};

/// Registers every endpoint together with the JSON and query error handlers
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .service(post_assessment_handler)
        .service(get_assessment_handler)
        .service(start_assessment_handler)
        .service(get_questions_handler)
        .service(submit_handler)
        .service(run_handler)
        .service(health_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    engine: web::Data<AssessmentEngine>,
) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
