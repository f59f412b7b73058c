use salvo::prelude::*;

use crate::web::metrics::format_prometheus;

/// Prometheus text exposition of the process counters.
#[handler]
pub async fn metrics(res: &mut Response) {
    res.render(Text::Plain(format_prometheus()));
}
