//! # In-page Capture Script
//!
//! JavaScript injected into the telephony page. It taps the call's remote
//! audio, downsamples it to 16kHz mono 16-bit PCM and streams binary frames
//! to the local relay (`/ws/capture?call_id=...`). Agent audio pushed back by
//! the relay is played in the page when relay playback is enabled.
//!
//! The script keeps its handle on `window.__voiceDialerCapture` so the
//! teardown snippet can stop it.

use serde_json::Value;

const TEMPLATE: &str = r#"(() => {
  if (window.__voiceDialerCapture) { window.__voiceDialerCapture.stop(); }
  const RELAY_URL = __RELAY_URL__;
  const TARGET_RATE = __SAMPLE_RATE__;
  const state = { ws: null, ctx: null, nodes: [], playhead: 0, stopped: false };

  const send = (msg) => {
    if (state.ws && state.ws.readyState === WebSocket.OPEN) { state.ws.send(JSON.stringify(msg)); }
  };

  const toPcm16 = (input, inputRate) => {
    const ratio = inputRate / TARGET_RATE;
    const length = Math.floor(input.length / ratio);
    const out = new Int16Array(length);
    for (let i = 0; i < length; i++) {
      const s = Math.max(-1, Math.min(1, input[Math.floor(i * ratio)]));
      out[i] = s < 0 ? s * 0x8000 : s * 0x7fff;
    }
    return out;
  };

  const findRemoteStream = () => {
    for (const el of document.querySelectorAll('audio, video')) {
      if (el.srcObject && el.srcObject.getAudioTracks().length > 0) { return el.srcObject; }
    }
    return null;
  };

  const play = (buffer) => {
    if (!state.ctx) { return; }
    const pcm = new Int16Array(buffer);
    const audio = state.ctx.createBuffer(1, pcm.length, TARGET_RATE);
    const channel = audio.getChannelData(0);
    for (let i = 0; i < pcm.length; i++) { channel[i] = pcm[i] / 0x8000; }
    const src = state.ctx.createBufferSource();
    src.buffer = audio;
    src.connect(state.ctx.destination);
    state.playhead = Math.max(state.playhead, state.ctx.currentTime);
    src.start(state.playhead);
    state.playhead += audio.duration;
    state.nodes.push(src);
  };

  const clearPlayback = () => {
    for (const node of state.nodes) { try { node.stop(); } catch (e) {} }
    state.nodes = [];
    if (state.ctx) { state.playhead = state.ctx.currentTime; }
  };

  const start = async () => {
    state.ws = new WebSocket(RELAY_URL);
    state.ws.binaryType = 'arraybuffer';
    state.ws.onmessage = (event) => {
      if (typeof event.data === 'string') {
        const msg = JSON.parse(event.data);
        if (msg.type === 'clear_playback') { clearPlayback(); }
        if (msg.type === 'ping') { send({ type: 'pong' }); }
      } else {
        play(event.data);
      }
    };
    await new Promise((resolve, reject) => {
      state.ws.onopen = resolve;
      state.ws.onerror = reject;
    });

    try {
      state.ctx = new AudioContext();
      let stream = findRemoteStream();
      if (!stream) {
        stream = await navigator.mediaDevices.getUserMedia({ audio: true });
        const track = stream.getAudioTracks()[0];
        send({ type: 'device_selected', device_id: track.getSettings().deviceId || '', label: track.label });
      }
      const source = state.ctx.createMediaStreamSource(stream);
      const processor = state.ctx.createScriptProcessor(4096, 1, 1);
      processor.onaudioprocess = (event) => {
        if (state.stopped || state.ws.readyState !== WebSocket.OPEN) { return; }
        const pcm = toPcm16(event.inputBuffer.getChannelData(0), state.ctx.sampleRate);
        state.ws.send(pcm.buffer);
      };
      source.connect(processor);
      processor.connect(state.ctx.destination);
      state.nodes.push(source, processor);
      send({ type: 'capture_started' });
    } catch (err) {
      send({ type: 'capture_error', message: String(err) });
    }
  };

  window.__voiceDialerCapture = {
    stop: () => {
      state.stopped = true;
      clearPlayback();
      if (state.ctx) { state.ctx.close(); state.ctx = null; }
      if (state.ws) { state.ws.close(); state.ws = null; }
      delete window.__voiceDialerCapture;
    },
  };
  start().catch((err) => console.error('voice-dialer capture failed', err));
})();"#;

/// Snippet that stops the capture graph and closes the relay socket.
pub const TEARDOWN_SCRIPT: &str =
    "window.__voiceDialerCapture ? (window.__voiceDialerCapture.stop(), true) : false";

/// Relay URL with the call id query appended.
pub fn relay_endpoint(relay_url: &str, call_id: &str) -> String {
    let separator = if relay_url.contains('?') { '&' } else { '?' };
    format!("{}{}call_id={}", relay_url, separator, call_id)
}

/// Build the capture script for one call.
pub fn build_capture_script(relay_url: &str, call_id: &str, sample_rate: u32) -> String {
    let endpoint = Value::String(relay_endpoint(relay_url, call_id)).to_string();
    TEMPLATE
        .replace("__RELAY_URL__", &endpoint)
        .replace("__SAMPLE_RATE__", &sample_rate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_embeds_relay_and_rate() {
        let script = build_capture_script("ws://127.0.0.1:8080/ws/capture", "call-42", 16_000);
        assert!(script.contains(r#"const RELAY_URL = "ws://127.0.0.1:8080/ws/capture?call_id=call-42";"#));
        assert!(script.contains("const TARGET_RATE = 16000;"));
        assert!(!script.contains("__RELAY_URL__"));
    }

    #[test]
    fn test_relay_endpoint_query() {
        assert_eq!(
            relay_endpoint("ws://h/ws/capture?x=1", "abc"),
            "ws://h/ws/capture?x=1&call_id=abc"
        );
    }
}
