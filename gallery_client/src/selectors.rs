pub mod meta {
    use lazy_static::lazy_static;
    use scraper::Selector;

    lazy_static! {
        pub static ref TITLE: Selector = Selector::parse("div.gallery_jieshao h1").unwrap();
        pub static ref INTRO_PARAGRAPHS: Selector = Selector::parse("div.gallery_jieshao p").unwrap();
        pub static ref ANCHOR: Selector = Selector::parse("a").unwrap();
        pub static ref PERSON: Selector = Selector::parse("div.gallery_nav div.gallery_renwu").unwrap();
        pub static ref PERSON_NAME: Selector = Selector::parse("div.gallery_renwu_title a").unwrap();
        pub static ref ROLE_ORGANIZATION: Selector = Selector::parse("div.gallery_chuangzuo").unwrap();
        pub static ref ROLE_MODEL: Selector = Selector::parse("div.gallery_chujing").unwrap();
    }
}
