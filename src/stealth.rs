//! Fingerprint masking injected into every page before site code runs

/// Initialization script installed at context level so it executes before any
/// page script, in every frame. Guarded by a non-enumerable marker on the
/// global object so repeated installation is a no-op.
pub const STEALTH_INIT: &str = r#"
(() => {
    if (Object.getOwnPropertyDescriptor(globalThis, '__rdHardened')) {
        return;
    }
    Object.defineProperty(globalThis, '__rdHardened', {
        value: true,
        enumerable: false,
        configurable: false,
        writable: false,
    });

    // Hide the webdriver flag
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true,
    });

    // Plugins and mime types shaped like a real desktop Chrome
    const fakePlugins = [
        { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    ];
    Object.defineProperty(navigator, 'plugins', {
        get: () => {
            const arr = fakePlugins.slice();
            arr.item = (i) => arr[i] || null;
            arr.namedItem = (n) => arr.find((p) => p.name === n) || null;
            return arr;
        },
        configurable: true,
    });
    Object.defineProperty(navigator, 'mimeTypes', {
        get: () => {
            const arr = [
                { type: 'application/pdf', suffixes: 'pdf', description: 'Portable Document Format' },
            ];
            arr.item = (i) => arr[i] || null;
            arr.namedItem = (t) => arr.find((m) => m.type === t) || null;
            return arr;
        },
        configurable: true,
    });

    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true,
    });

    // Notification permission queries answer like an interactive browser
    if (navigator.permissions && navigator.permissions.query) {
        const originalQuery = navigator.permissions.query.bind(navigator.permissions);
        navigator.permissions.query = (parameters) =>
            parameters && parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : originalQuery(parameters);
    }

    // WebGL vendor/renderer spoof
    const patchGl = (proto) => {
        if (!proto) return;
        const getParameter = proto.getParameter;
        proto.getParameter = function (parameter) {
            if (parameter === 37445) return 'Intel Inc.';
            if (parameter === 37446) return 'Intel Iris OpenGL Engine';
            return getParameter.call(this, parameter);
        };
    };
    patchGl(typeof WebGLRenderingContext !== 'undefined' ? WebGLRenderingContext.prototype : null);
    patchGl(typeof WebGL2RenderingContext !== 'undefined' ? WebGL2RenderingContext.prototype : null);

    // Canvas readback noise
    if (typeof HTMLCanvasElement !== 'undefined') {
        const toDataURL = HTMLCanvasElement.prototype.toDataURL;
        HTMLCanvasElement.prototype.toDataURL = function (...args) {
            const ctx = this.getContext('2d');
            if (ctx && this.width > 16 && this.height > 16) {
                const pixel = ctx.getImageData(0, 0, 1, 1);
                pixel.data[0] = pixel.data[0] ^ 1;
                ctx.putImageData(pixel, 0, 0);
            }
            return toDataURL.apply(this, args);
        };
    }

    Object.defineProperty(navigator, 'hardwareConcurrency', {
        get: () => 8,
        configurable: true,
    });
    Object.defineProperty(navigator, 'deviceMemory', {
        get: () => 8,
        configurable: true,
    });

    if (navigator.connection) {
        Object.defineProperty(navigator.connection, 'rtt', { get: () => 50, configurable: true });
        Object.defineProperty(navigator.connection, 'downlink', { get: () => 10, configurable: true });
        Object.defineProperty(navigator.connection, 'effectiveType', { get: () => '4g', configurable: true });
    }

    // Headless Chrome reports outer dimensions of zero
    if (window.outerWidth === 0) {
        Object.defineProperty(window, 'outerWidth', { get: () => window.innerWidth, configurable: true });
        Object.defineProperty(window, 'outerHeight', { get: () => window.innerHeight + 88, configurable: true });
    }

    if (!window.chrome) {
        window.chrome = { runtime: {} };
    }
})();
"#;

/// Context-level HTTP headers consistent with the chosen user agent.
///
/// Chromium-family agents additionally advertise client hints; every agent
/// carries Accept and Accept-Language derived from the requested locale.
pub fn headers_for_agent(user_agent: &str, locale: &str) -> Vec<(String, String)> {
    let mut headers = vec![
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .to_string(),
        ),
        ("Accept-Language".to_string(), format!("{locale},en;q=0.9")),
    ];

    if let Some(major) = chromium_major_version(user_agent) {
        headers.push((
            "sec-ch-ua".to_string(),
            format!("\"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\", \"Not-A.Brand\";v=\"99\""),
        ));
        headers.push(("sec-ch-ua-mobile".to_string(), "?0".to_string()));
        let platform = if user_agent.contains("Macintosh") {
            "macOS"
        } else if user_agent.contains("Windows") {
            "Windows"
        } else {
            "Linux"
        };
        headers.push((
            "sec-ch-ua-platform".to_string(),
            format!("\"{platform}\""),
        ));
    }

    headers
}

fn chromium_major_version(user_agent: &str) -> Option<u32> {
    let idx = user_agent.find("Chrome/")?;
    let rest = &user_agent[idx + "Chrome/".len()..];
    let major: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    major.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealth_script_is_guarded() {
        // The installation marker must be set non-enumerably before any patch
        assert!(STEALTH_INIT.contains("__rdHardened"));
        assert!(STEALTH_INIT.contains("enumerable: false"));
        let guard = STEALTH_INIT.find("__rdHardened").unwrap();
        let webdriver = STEALTH_INIT.find("webdriver").unwrap();
        assert!(guard < webdriver);
    }

    #[test]
    fn chromium_agents_get_client_hints() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
        let headers = headers_for_agent(ua, "en-US");
        assert!(headers.iter().any(|(k, v)| k == "sec-ch-ua" && v.contains("126")));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "sec-ch-ua-platform" && v.contains("Windows")));
    }

    #[test]
    fn non_chromium_agents_skip_client_hints() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:127.0) Gecko/20100101 Firefox/127.0";
        let headers = headers_for_agent(ua, "de-DE");
        assert!(!headers.iter().any(|(k, _)| k.starts_with("sec-ch-ua")));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Accept-Language" && v.starts_with("de-DE")));
    }
}
