#![forbid(unsafe_code)]

use std::time::Duration;

use proptest::prelude::*;

use super::{IrcLine, IrcParseError, decode_event};
use crate::{PlatformEvent, SubPlan};

fn decode(raw: &str) -> Vec<PlatformEvent> {
	decode_event(&IrcLine::parse(raw).expect("valid irc line"))
}

fn single(raw: &str) -> PlatformEvent {
	let mut events = decode(raw);
	assert_eq!(events.len(), 1, "expected exactly one event for {raw}: {events:?}");
	events.remove(0)
}

#[test]
fn parses_tags_prefix_and_trailing() {
	let line = IrcLine::parse(
		"@badges=moderator/1;display-name=Foo;room-id=77 :foo!foo@foo.tmi.twitch.tv PRIVMSG #chan :hello there\r\n",
	)
	.unwrap();
	assert_eq!(line.command, "PRIVMSG");
	assert_eq!(line.nick(), Some("foo"));
	assert_eq!(line.params, vec!["#chan".to_string(), "hello there".to_string()]);
	assert_eq!(line.tag("room-id"), Some("77"));
	assert_eq!(line.channel().unwrap().as_str(), "chan");
}

#[test]
fn unescapes_tag_values_and_hides_empty_tags() {
	let line = IrcLine::parse(r"@system-msg=a\sb\:c\\d;color= :tmi.twitch.tv USERNOTICE #chan").unwrap();
	assert_eq!(line.tag("system-msg"), Some(r"a b;c\d"));
	assert_eq!(line.tag("color"), None);
	assert!(line.tags.contains_key("color"));
}

#[test]
fn parses_bare_commands() {
	let ping = IrcLine::parse("PING :tmi.twitch.tv").unwrap();
	assert_eq!(ping.command, "PING");
	assert_eq!(ping.param(0), Some("tmi.twitch.tv"));
	assert!(ping.prefix.is_none());

	assert_eq!(IrcLine::parse("  \r\n"), Err(IrcParseError::Empty));
	assert!(matches!(IrcLine::parse(":prefix.only"), Err(IrcParseError::MissingCommand(_))));
}

#[test]
fn privmsg_becomes_chat_message() {
	let ev = single(
		"@badges=subscriber/12,premium/1;color=#FF0000;display-name=Viewer;id=abc-1;room-id=42;user-id=9 \
		 :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #Streamer :\u{1}ACTION waves\u{1}",
	);
	let PlatformEvent::Message(msg) = ev else {
		panic!("expected message");
	};
	assert_eq!(msg.channel.as_str(), "streamer");
	assert_eq!(msg.channel_id.as_deref(), Some("42"));
	assert_eq!(msg.id.as_ref().map(|i| i.as_str()), Some("abc-1"));
	assert_eq!(msg.author.display_name(), "Viewer");
	assert_eq!(msg.author.id.as_deref(), Some("9"));
	assert_eq!(msg.text, "waves");
	assert!(msg.is_action);
	assert_eq!(msg.badges, vec!["subscriber/12".to_string(), "premium/1".to_string()]);
	assert_eq!(msg.color.as_deref(), Some("#FF0000"));
}

#[test]
fn cheer_and_reward_also_carry_the_message() {
	let events = decode(
		"@bits=100;custom-reward-id=r-1;display-name=Rich;room-id=42 :rich!rich@rich.tmi.twitch.tv PRIVMSG #s :cheer100 hi",
	);
	assert_eq!(events.len(), 3);
	assert!(matches!(&events[0], PlatformEvent::Cheer(c) if c.bits == 100 && c.total_bits.is_none()));
	assert!(matches!(&events[1], PlatformEvent::Reward(r) if r.reward == "r-1"));
	assert!(matches!(&events[2], PlatformEvent::Message(m) if m.text == "cheer100 hi"));
}

#[test]
fn jtv_host_announcement_becomes_host() {
	let ev = single(":jtv!jtv@jtv.tmi.twitch.tv PRIVMSG #me :Someone is now hosting you.");
	assert!(matches!(ev, PlatformEvent::Host(h) if h.hoster == "Someone" && h.channel.as_str() == "me"));

	assert!(decode(":jtv!jtv@jtv.tmi.twitch.tv PRIVMSG #me :unrelated").is_empty());
}

#[test]
fn notice_keeps_tag_and_drops_empty_body() {
	let ev = single("@msg-id=slow_on :tmi.twitch.tv NOTICE #chan :This room is now in slow mode.");
	let PlatformEvent::Notice(n) = ev else {
		panic!("expected notice");
	};
	assert_eq!(n.tag.as_deref(), Some("slow_on"));
	assert_eq!(n.message.as_deref(), Some("This room is now in slow mode."));
	assert_eq!(n.channel.unwrap().as_str(), "chan");

	let PlatformEvent::Notice(empty) = single("@msg-id=mystery :tmi.twitch.tv NOTICE #chan :") else {
		panic!("expected notice");
	};
	assert!(empty.message.is_none());

	let PlatformEvent::Notice(global) = single(":tmi.twitch.tv NOTICE * :Login authentication failed") else {
		panic!("expected notice");
	};
	assert!(global.channel.is_none());
	assert!(global.tag.is_none());
}

#[test]
fn clearchat_variants() {
	assert!(matches!(
		single("@room-id=1 :tmi.twitch.tv CLEARCHAT #chan"),
		PlatformEvent::ChatCleared(c) if c.channel_id.as_deref() == Some("1")
	));

	let PlatformEvent::UserTimedOut(t) =
		single("@ban-duration=600;room-id=1;target-user-id=5 :tmi.twitch.tv CLEARCHAT #chan :Troll")
	else {
		panic!("expected timeout");
	};
	assert_eq!(t.duration, Some(Duration::from_secs(600)));
	assert_eq!(t.user.login, "troll");
	assert_eq!(t.user.id.as_deref(), Some("5"));

	assert!(matches!(
		single("@room-id=1;target-user-id=5 :tmi.twitch.tv CLEARCHAT #chan :troll"),
		PlatformEvent::UserBanned(b) if b.duration.is_none()
	));
}

#[test]
fn clearmsg_needs_target_id() {
	let PlatformEvent::MessageDeleted(d) =
		single("@login=bob;target-msg-id=m-1 :tmi.twitch.tv CLEARMSG #chan :bad words")
	else {
		panic!("expected deletion");
	};
	assert_eq!(d.message_id.as_str(), "m-1");
	assert_eq!(d.login.as_deref(), Some("bob"));

	assert!(decode("@login=bob :tmi.twitch.tv CLEARMSG #chan :bad words").is_empty());
}

#[test]
fn usernotice_subscriptions() {
	let PlatformEvent::Subscription(sub) = single(
		"@msg-id=resub;login=fan;display-name=Fan;msg-param-sub-plan=2000;msg-param-cumulative-months=7;room-id=3 \
		 :tmi.twitch.tv USERNOTICE #chan :great stream",
	) else {
		panic!("expected subscription");
	};
	assert_eq!(sub.plan, SubPlan::Tier2);
	assert_eq!(sub.months, Some(7));
	assert!(!sub.gift);
	assert_eq!(sub.user.display_name(), "Fan");

	let PlatformEvent::Subscription(gift) = single(
		"@msg-id=subgift;login=giver;msg-param-recipient-user-name=lucky;msg-param-recipient-display-name=Lucky;\
		 msg-param-sub-plan=Prime :tmi.twitch.tv USERNOTICE #chan",
	) else {
		panic!("expected gift");
	};
	assert!(gift.gift);
	assert_eq!(gift.plan, SubPlan::Prime);
	assert_eq!(gift.user.login, "lucky");
}

#[test]
fn usernotice_raid_and_unknown() {
	let PlatformEvent::Raid(raid) = single(
		"@msg-id=raid;login=raider;msg-param-displayName=Raider;msg-param-viewerCount=250;user-id=8 \
		 :tmi.twitch.tv USERNOTICE #chan",
	) else {
		panic!("expected raid");
	};
	assert_eq!(raid.viewers, 250);
	assert_eq!(raid.raider.display_name(), "Raider");

	assert!(decode("@msg-id=bitsbadgetier;login=x :tmi.twitch.tv USERNOTICE #chan").is_empty());
	assert!(decode(":tmi.twitch.tv 001 me :Welcome, GLHF!").is_empty());
}

proptest! {
	#[test]
	fn parse_never_panics(raw in "\\PC{0,200}") {
		let _ = IrcLine::parse(&raw);
	}

	#[test]
	fn trailing_text_roundtrips(text in "[a-zA-Z0-9 !?.]{1,80}") {
		let line = IrcLine::parse(&format!(":u!u@u PRIVMSG #c :{text}")).unwrap();
		prop_assert_eq!(line.param(1), Some(text.as_str()));
	}
}
