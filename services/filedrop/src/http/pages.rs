//! HTML pages served by the gateway

use axum::response::Html;
use html_escape::{encode_double_quoted_attribute, encode_text};

const STYLE: &str = "body{font-family:sans-serif;margin:2rem}li{margin:.25rem 0}";

fn layout(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title><style>{}</style></head>\n<body>\n{}\n</body>\n</html>\n",
        encode_text(title),
        STYLE,
        body
    ))
}

/// Credential form posting to `/login`
pub fn login_page() -> Html<String> {
    layout(
        "Login",
        "<h1>Login</h1>\n\
         <form method=\"post\" action=\"/login\">\n\
         <label>Username <input type=\"text\" name=\"username\" autofocus></label><br>\n\
         <label>Password <input type=\"password\" name=\"password\"></label><br>\n\
         <button type=\"submit\">Log in</button>\n\
         </form>",
    )
}

/// Listing of stored object names, each linking to its download
pub fn file_list(names: &[String], client_id: Option<&str>) -> Html<String> {
    let heading = match client_id {
        Some(client_id) => format!("Files from {}", encode_text(client_id)),
        None => "Files".to_string(),
    };

    let items = if names.is_empty() {
        "<p>No files uploaded yet.</p>".to_string()
    } else {
        let entries: String = names
            .iter()
            .map(|name| {
                let href = format!("/download?filename={}", urlencoding::encode(name));
                format!(
                    "<li><a href=\"{}\">{}</a></li>\n",
                    encode_double_quoted_attribute(&href),
                    encode_text(name)
                )
            })
            .collect();
        format!("<ul>\n{}</ul>", entries)
    };

    layout(
        "Files",
        &format!(
            "<h1>{}</h1>\n{}\n<p><a href=\"/logout\">Log out</a></p>",
            heading, items
        ),
    )
}
