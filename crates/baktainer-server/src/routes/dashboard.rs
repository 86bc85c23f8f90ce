//! Minimal operator dashboard.

use axum::response::Html;

/// `GET /`: a single static page that polls the JSON API.
pub async fn index() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Baktainer</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #f7f7f8; color: #1f2328; }
  h1 { font-size: 1.4rem; }
  .cards { display: flex; gap: 1rem; flex-wrap: wrap; margin-bottom: 1.5rem; }
  .card { background: #fff; border: 1px solid #d8dbe0; border-radius: 8px; padding: 1rem 1.4rem; min-width: 10rem; }
  .card .value { font-size: 1.6rem; font-weight: 600; }
  .card .label { color: #6a737d; font-size: 0.85rem; }
  table { border-collapse: collapse; width: 100%; background: #fff; }
  th, td { text-align: left; padding: 0.5rem 0.8rem; border-bottom: 1px solid #e4e7eb; font-size: 0.9rem; }
  .ok { color: #1a7f37; }
  .bad { color: #cf222e; }
</style>
</head>
<body>
<h1>Baktainer backups</h1>
<div class="cards">
  <div class="card"><div class="value" id="total">-</div><div class="label">Backups recorded</div></div>
  <div class="card"><div class="value" id="rate">-</div><div class="label">Success rate</div></div>
  <div class="card"><div class="value" id="data">-</div><div class="label">Data backed up</div></div>
  <div class="card"><div class="value" id="alerts">-</div><div class="label">Active alerts</div></div>
</div>
<table>
  <thead><tr><th>Container</th><th>Time</th><th>Status</th><th>Size</th><th>Duration</th></tr></thead>
  <tbody id="history"></tbody>
</table>
<script>
function bytes(n) {
  if (n > 1073741824) return (n / 1073741824).toFixed(1) + ' GiB';
  if (n > 1048576) return (n / 1048576).toFixed(1) + ' MiB';
  if (n > 1024) return (n / 1024).toFixed(1) + ' KiB';
  return n + ' B';
}
async function refresh() {
  const summary = await (await fetch('/api/status')).json();
  document.getElementById('total').textContent = summary.total;
  document.getElementById('rate').textContent = summary.success_rate.toFixed(0) + '%';
  document.getElementById('data').textContent = bytes(summary.total_data_bytes);
  document.getElementById('alerts').textContent = summary.active_alerts;

  const history = await (await fetch('/api/history?limit=25')).json();
  document.getElementById('history').innerHTML = history.records.map(r => `
    <tr>
      <td>${r.container_name}</td>
      <td>${new Date(r.timestamp).toLocaleString()}</td>
      <td class="${r.status === 'success' ? 'ok' : 'bad'}">${r.status}</td>
      <td>${bytes(r.file_size_bytes)}</td>
      <td>${r.duration_seconds.toFixed(1)}s</td>
    </tr>`).join('');
}
refresh();
setInterval(refresh, 10000);
</script>
</body>
</html>
"#;
