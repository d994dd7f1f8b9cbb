//! Login page and embedded static assets

const STYLESHEET: &str = r#"*,
*::before,
*::after {
  box-sizing: border-box;
}

body {
  margin: 0;
  min-height: 100vh;
  display: flex;
  align-items: center;
  justify-content: center;
  background: #f1f3f5;
  color: #212529;
  font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
}

.login {
  width: 100%;
  max-width: 360px;
  padding: 2rem;
  background: #fff;
  border-radius: 6px;
  box-shadow: 0 2px 12px rgba(0, 0, 0, 0.08);
}

.login h1 {
  margin: 0 0 1.5rem;
  font-size: 1.5rem;
  text-align: center;
}

.login label {
  display: block;
  margin-bottom: 0.25rem;
  font-size: 0.875rem;
}

.login input {
  width: 100%;
  margin-bottom: 1rem;
  padding: 0.5rem 0.75rem;
  border: 1px solid #ced4da;
  border-radius: 4px;
  font-size: 1rem;
}

.login button {
  width: 100%;
  padding: 0.6rem;
  border: 0;
  border-radius: 4px;
  background: #1c7ed6;
  color: #fff;
  font-size: 1rem;
  cursor: pointer;
}

.login .error {
  margin-bottom: 1rem;
  padding: 0.5rem 0.75rem;
  border-radius: 4px;
  background: #ffe3e3;
  color: #c92a2a;
  font-size: 0.875rem;
}
"#;

/// An embedded file served under `{root}/assets/`
#[derive(Debug, Clone, Copy)]
pub struct Asset {
    pub content_type: &'static str,
    pub body: &'static str,
}

/// Look up an embedded asset by its path below `assets/`
pub fn asset(name: &str) -> Option<Asset> {
    match name {
        "styles.css" => Some(Asset {
            content_type: "text/css; charset=utf-8",
            body: STYLESHEET,
        }),
        _ => None,
    }
}

/// Render the login form.
///
/// `root` is the gateway prefix without a trailing slash. `error` is shown above
/// the form when set.
pub fn login_page(title: &str, root: &str, username: &str, error: Option<&str>) -> String {
    let title = escape_html(title);
    let root = escape_html(root);
    let error = error
        .map(|message| format!(r#"      <div class="error">{}</div>"#, escape_html(message)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <link rel="stylesheet" href="{root}/assets/styles.css">
  </head>
  <body>
    <form class="login" method="post" action="{root}/login">
      <h1>{title}</h1>
{error}
      <label for="username">Username</label>
      <input id="username" name="username" type="text" value="{username}" autocomplete="username" autofocus required>
      <label for="password">Password</label>
      <input id="password" name="password" type="password" autocomplete="current-password" required>
      <button type="submit">Sign in</button>
    </form>
  </body>
</html>
"#,
        title = title,
        root = root,
        error = error,
        username = escape_html(username),
    )
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
