use hypertwo::{Bytes, Request, Response};

fn redirect_response(status: u16, location: &str) -> Response {
    Response::new(
        status,
        vec![("location".to_owned(), location.to_owned())],
        "",
    )
}

#[test]
fn redirect_follows_location() {
    let request = Request::get("https://example.com/a".parse().unwrap(), None);
    let next = request
        .redirect(&redirect_response(301, "https://www.example.com/b"))
        .unwrap();
    assert_eq!(next.header(":authority"), Some("www.example.com"));
    assert_eq!(next.path(), "/b");
    assert_eq!(next.method(), "GET");
}

#[test]
fn redirect_resolves_relative_locations() {
    let request = Request::get("https://example.com/dir/page".parse().unwrap(), None);
    let next = request.redirect(&redirect_response(302, "other")).unwrap();
    assert_eq!(next.header(":authority"), Some("example.com"));
    assert_eq!(next.path(), "/dir/other");
}

#[test]
fn see_other_downgrades_to_get() {
    let request = Request::post(
        "https://example.com/form".parse().unwrap(),
        None,
        "a=1&b=2",
    );
    let next = request.redirect(&redirect_response(303, "/result")).unwrap();
    assert_eq!(next.method(), "GET");
    assert!(next.body.is_empty());
}

#[test]
fn permanent_redirect_keeps_method_and_body() {
    let request = Request::post(
        "https://example.com/submit".parse().unwrap(),
        None,
        "payload",
    );
    let next = request
        .redirect(&redirect_response(308, "/submit2"))
        .unwrap();
    assert_eq!(next.method(), "POST");
    assert_eq!(next.body, Bytes::from_static(b"payload"));
}

#[test]
fn non_redirect_statuses_yield_nothing() {
    let request = Request::get("https://example.com/".parse().unwrap(), None);
    assert!(request.redirect(&Response::new(200, vec![], "ok")).is_none());
    assert!(request
        .redirect(&Response::new(404, vec![], "missing"))
        .is_none());
}
