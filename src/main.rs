use rocket::launch;

#[launch]
fn launch() -> _ {
    import_server::rocket()
}
