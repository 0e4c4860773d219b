use super::handlers::{auth, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(health::connection_test))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::session::logout))
        .routes(routes!(auth::department::department));

    let mut smartspace_tag = Tag::new("smartspace");
    smartspace_tag.description = Some("Liveness and health of the login portal".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Role-based login, logout and session lookups".to_string());

    router.get_openapi_mut().tags = Some(vec![smartspace_tag, auth_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `:` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(':').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, rest)) => (
            optional_str(name),
            optional_str(rest.trim_end_matches('>')),
        ),
        None => (optional_str(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, "smartspace");
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));

        let contact = spec.info.contact;
        assert_eq!(
            contact.as_ref().and_then(|c| c.name.as_deref()),
            Some("MCiSmartSpace Team")
        );
        assert_eq!(
            contact.as_ref().and_then(|c| c.email.as_deref()),
            Some("dev@mcismartspace.local")
        );
        assert_eq!(
            spec.info.license.map(|license| license.name),
            Some("BSD-3-Clause".to_string())
        );
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "smartspace"));
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        for path in [
            "/health",
            "/connection-test",
            "/auth/login",
            "/auth/logout",
            "/users/api/department",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn parse_author_variants() {
        assert_eq!(
            parse_author("Jane <jane@x.edu>"),
            (Some("Jane"), Some("jane@x.edu"))
        );
        assert_eq!(parse_author("Jane"), (Some("Jane"), None));
        assert_eq!(parse_author("<a@x.edu>"), (None, Some("a@x.edu")));
    }
}
